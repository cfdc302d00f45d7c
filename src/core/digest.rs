//! Content digests and the asynchronous digest service
//!
//! The read cache never hashes on the caller's thread. It hands buffers to
//! a [`DigestService`] together with a reply channel and picks the
//! completions up later. [`ThreadPoolDigester`] is the bundled service;
//! anything implementing the trait can be injected instead.

use crossbeam::channel::{self, Sender};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Length of a content digest in bytes
pub const DIGEST_LEN: usize = 32;

/// SHA-256 content digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
    /// Hash a byte slice
    pub fn of(bytes: &[u8]) -> Self {
        Digest(Sha256::digest(bytes).into())
    }

    /// Hash a sequence of slices as if they were concatenated
    pub fn of_parts<'a, I>(parts: I) -> Self
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        Digest(hasher.finalize().into())
    }

    /// Read a digest from exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; DIGEST_LEN] = bytes.try_into().ok()?;
        Some(Digest(array))
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Lowercase hex rendering
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}...)", &self.to_hex()[..12])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A buffer submitted for hashing
pub struct DigestRequest {
    /// Caller-chosen identifier echoed back in the completion
    pub ticket: u64,
    pub data: Arc<[u8]>,
    /// Where the completion is delivered
    pub reply: Sender<DigestCompletion>,
}

/// Result of a [`DigestRequest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigestCompletion {
    pub ticket: u64,
    pub digest: Digest,
}

impl DigestRequest {
    /// Hash the buffer and deliver the completion
    ///
    /// A closed reply channel means the requester is gone; the result is
    /// dropped.
    pub fn complete(self) {
        let completion = DigestCompletion {
            ticket: self.ticket,
            digest: Digest::of(&self.data),
        };
        let _ = self.reply.send(completion);
    }
}

/// Asynchronous hashing collaborator
///
/// `submit` must not block on the hash computation itself.
pub trait DigestService: Send + Sync {
    fn submit(&self, request: DigestRequest);
}

/// Digest service backed by a fixed set of worker threads
pub struct ThreadPoolDigester {
    sender: Option<Sender<DigestRequest>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPoolDigester {
    /// Start `threads` workers (at least one)
    pub fn new(threads: usize) -> Self {
        let (sender, receiver) = channel::unbounded::<DigestRequest>();

        let workers = (0..threads.max(1))
            .filter_map(|i| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("pak-digest-{}", i))
                    .spawn(move || {
                        for request in receiver.iter() {
                            request.complete();
                        }
                    })
                    .map_err(|e| tracing::warn!("Failed to spawn digest worker {}: {}", i, e))
                    .ok()
            })
            .collect();

        ThreadPoolDigester {
            sender: Some(sender),
            workers,
        }
    }

    /// Number of live worker threads
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl DigestService for ThreadPoolDigester {
    fn submit(&self, request: DigestRequest) {
        if self.workers.is_empty() {
            request.complete();
            return;
        }

        if let Some(sender) = &self.sender {
            if let Err(err) = sender.send(request) {
                // Workers are gone; hash inline rather than lose the request
                err.into_inner().complete();
            }
        }
    }
}

impl Drop for ThreadPoolDigester {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Digest service that hashes on the submitting thread
///
/// Completions are available as soon as `submit` returns.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDigester;

impl DigestService for InlineDigester {
    fn submit(&self, request: DigestRequest) {
        request.complete();
    }
}
