//! Deterministic providers for headless runs and tests.

use std::sync::Mutex;

use crate::{RequestToken, TileCallback, TileError, TilePayload, TileProvider, TileRequest};

type TileFn = dyn Fn(&TileRequest) -> Result<TilePayload, TileError> + Send + Sync;

/// Answers every request synchronously, inside `request_tile`.
pub struct ImmediateProvider {
    produce: Box<TileFn>,
}

impl ImmediateProvider {
    pub fn new(
        produce: impl Fn(&TileRequest) -> Result<TilePayload, TileError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            produce: Box::new(produce),
        }
    }
}

impl TileProvider for ImmediateProvider {
    fn request_tile(&self, request: TileRequest, on_complete: TileCallback) -> RequestToken {
        let token = request.token;
        on_complete((self.produce)(&request));
        token
    }
}

#[derive(Default)]
struct ManualState {
    queued: Vec<(TileRequest, TileCallback)>,
    cancelled: Vec<RequestToken>,
    requested: usize,
}

/// Holds requests until the test completes them explicitly.
#[derive(Default)]
pub struct ManualProvider {
    state: Mutex<ManualState>,
}

impl ManualProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ManualState) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Requests received and not yet completed (cancelled ones included).
    pub fn pending_count(&self) -> usize {
        self.with_state(|s| s.queued.len())
    }

    /// Total requests ever received.
    pub fn requested_count(&self) -> usize {
        self.with_state(|s| s.requested)
    }

    /// Copies of the queued requests, oldest first.
    pub fn requests(&self) -> Vec<TileRequest> {
        self.with_state(|s| s.queued.iter().map(|(r, _)| r.clone()).collect())
    }

    /// Tokens passed to [`TileProvider::cancel`], in call order.
    pub fn cancelled(&self) -> Vec<RequestToken> {
        self.with_state(|s| s.cancelled.clone())
    }

    /// Complete the oldest queued request. Returns `false` if none is queued.
    pub fn complete_next(&self, result: Result<TilePayload, TileError>) -> bool {
        let next = self.with_state(|s| {
            if s.queued.is_empty() {
                None
            } else {
                Some(s.queued.remove(0))
            }
        });
        match next {
            Some((_, callback)) => {
                callback(result);
                true
            }
            None => false,
        }
    }

    /// Complete every queued request with `f(request)`.
    pub fn complete_all(
        &self,
        f: impl Fn(&TileRequest) -> Result<TilePayload, TileError>,
    ) -> usize {
        let queued = self.with_state(|s| std::mem::take(&mut s.queued));
        let n = queued.len();
        for (request, callback) in queued {
            callback(f(&request));
        }
        n
    }

    pub fn fail_all(&self, reason: &str) -> usize {
        self.complete_all(|_| Err(TileError::Provider(reason.to_string())))
    }
}

impl TileProvider for ManualProvider {
    fn request_tile(&self, request: TileRequest, on_complete: TileCallback) -> RequestToken {
        let token = request.token;
        self.with_state(|s| {
            s.requested += 1;
            s.queued.push((request, on_complete));
        });
        token
    }

    fn cancel(&self, token: RequestToken) {
        self.with_state(|s| s.cancelled.push(token));
    }
}
