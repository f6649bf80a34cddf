//! Tracks outstanding tile requests and funnels their results back to the
//! frame loop.
//!
//! Provider callbacks may run on any thread. They only push
//! `(token, result)` into a channel; [`TileLoader::drain`] hands back the
//! results whose tokens are still pending, so anything cancelled in the
//! meantime is dropped here.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, unbounded};
use rustc_hash::FxHashMap;

use orbis_math::{Extent, TileProjection};

use crate::{
    LayerId, NodeHandle, RequestToken, TileError, TileKind, TilePayload, TileProvider, TileRequest,
};

type TileResult = Result<TilePayload, TileError>;

struct PendingRequest {
    node: NodeHandle,
    kind: TileKind,
    generation: u64,
    provider: Arc<dyn TileProvider>,
    provider_token: RequestToken,
}

/// A finished request whose token was still pending when drained.
#[derive(Debug)]
pub struct Completion {
    pub token: RequestToken,
    pub node: NodeHandle,
    pub kind: TileKind,
    /// Layer generation at request time (0 for terrain).
    pub generation: u64,
    pub result: TileResult,
}

/// Parameters of a new request.
#[derive(Clone, Copy, Debug)]
pub struct RequestSpec {
    pub node: NodeHandle,
    pub extent: Extent,
    pub depth: u8,
    pub projection: TileProjection,
    pub kind: TileKind,
    pub generation: u64,
}

pub struct TileLoader {
    sender: Sender<(RequestToken, TileResult)>,
    receiver: Receiver<(RequestToken, TileResult)>,
    pending: FxHashMap<RequestToken, PendingRequest>,
    next_token: u64,
}

impl Default for TileLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl TileLoader {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender,
            receiver,
            pending: FxHashMap::default(),
            next_token: 0,
        }
    }

    /// Issue a request to `provider` and remember who it is for.
    pub fn request(&mut self, provider: &Arc<dyn TileProvider>, spec: RequestSpec) -> RequestToken {
        self.next_token += 1;
        let token = RequestToken(self.next_token);

        // Registered before the call: providers may complete synchronously.
        self.pending.insert(
            token,
            PendingRequest {
                node: spec.node,
                kind: spec.kind,
                generation: spec.generation,
                provider: Arc::clone(provider),
                provider_token: token,
            },
        );

        let sender = self.sender.clone();
        let request = TileRequest {
            token,
            extent: spec.extent,
            depth: spec.depth,
            projection: spec.projection,
            kind: spec.kind,
        };
        let provider_token = provider.request_tile(
            request,
            Box::new(move |result| {
                let _ = sender.send((token, result));
            }),
        );
        if let Some(pending) = self.pending.get_mut(&token) {
            pending.provider_token = provider_token;
        }
        tracing::trace!(token = token.0, kind = ?spec.kind, depth = spec.depth, "Tile requested");
        token
    }

    /// Forget `token` and ask its provider to stop. Returns whether it was
    /// pending.
    pub fn cancel(&mut self, token: RequestToken) -> bool {
        match self.pending.remove(&token) {
            Some(pending) => {
                pending.provider.cancel(pending.provider_token);
                true
            }
            None => false,
        }
    }

    /// Cancel every pending imagery request for `layer`.
    pub fn cancel_layer(&mut self, layer: LayerId) -> usize {
        self.cancel_where(|p| p.kind == TileKind::Imagery(layer))
    }

    /// Cancel every pending terrain request.
    pub fn cancel_terrain(&mut self) -> usize {
        self.cancel_where(|p| p.kind == TileKind::Terrain)
    }

    fn cancel_where(&mut self, mut predicate: impl FnMut(&PendingRequest) -> bool) -> usize {
        let tokens: Vec<RequestToken> = self
            .pending
            .iter()
            .filter(|(_, p)| predicate(p))
            .map(|(t, _)| *t)
            .collect();
        for token in &tokens {
            self.cancel(*token);
        }
        tokens.len()
    }

    /// Take every result that arrived for a still-pending request.
    pub fn drain(&mut self) -> Vec<Completion> {
        let mut completions = Vec::new();
        while let Ok((token, result)) = self.receiver.try_recv() {
            let Some(pending) = self.pending.remove(&token) else {
                tracing::trace!(token = token.0, "Dropping result of a cancelled request");
                continue;
            };
            completions.push(Completion {
                token,
                node: pending.node,
                kind: pending.kind,
                generation: pending.generation,
                result,
            });
        }
        completions
    }

    pub fn is_pending(&self, token: RequestToken) -> bool {
        self.pending.contains_key(&token)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
