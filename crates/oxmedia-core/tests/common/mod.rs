//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use bytes::Bytes;
use oxmedia_core::{DecryptError, DecryptedMedia, Decryptor};

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
}

/// One-shot latch that holds decrypts until the test releases it.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cond.wait(open).unwrap();
        }
    }

    pub fn release(&self) {
        *self.open.lock().unwrap() = true;
        self.cond.notify_all();
    }
}

/// What a [`TestDecryptor`] does once it is allowed through the gate.
#[derive(Clone, Copy)]
pub enum Behavior {
    Succeed(usize),
    Fail,
    Panic,
}

/// Decryptor that counts invocations and can be held at a gate.
pub struct TestDecryptor {
    behavior: Behavior,
    gate: Option<Arc<Gate>>,
    calls: AtomicUsize,
}

impl TestDecryptor {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            gate: None,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn gated(behavior: Behavior) -> (Arc<Self>, Arc<Gate>) {
        let gate = Arc::new(Gate::default());
        let decryptor = Arc::new(Self {
            behavior,
            gate: Some(Arc::clone(&gate)),
            calls: AtomicUsize::new(0),
        });
        (decryptor, gate)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Decryptor for TestDecryptor {
    fn decrypt(&self, path: &Path) -> Result<DecryptedMedia, DecryptError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        match self.behavior {
            Behavior::Succeed(len) => Ok(DecryptedMedia::new(payload(len), "image/jpeg")),
            Behavior::Fail => Err(DecryptError::backend("authentication failed", path)),
            Behavior::Panic => panic!("decryptor blew up"),
        }
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 5s"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
