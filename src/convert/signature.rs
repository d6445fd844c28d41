//! Signature cache for thinking-block continuity.
//!
//! Gemini 3+ models require a `thoughtSignature` on tool calls and thinking
//! blocks in multi-turn conversations, but Anthropic-side clients strip
//! non-standard fields from responses. The proxy caches signatures on the
//! way out so they can be restored on the way back in.
//!
//! Two mappings are kept, both with a 2-hour TTL:
//!   - tool_use_id -> signature (restores function-call continuity)
//!   - signature -> model family (detects cross-family conversations)

use std::sync::Arc;
use std::time::Duration;

use crate::convert::anthropic::MIN_SIGNATURE_LENGTH;
use crate::convert::google::ModelFamily;
use crate::store::{prefix, Store};

/// How long cached signatures stay valid.
pub const SIGNATURE_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Store-backed signature cache. The [`Store`] provides the in-process
/// fallback when redis is absent, with the same TTL semantics.
#[derive(Clone)]
pub struct SignatureCache {
    store: Arc<Store>,
    ttl: Duration,
}

impl SignatureCache {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            ttl: SIGNATURE_TTL,
        }
    }

    #[cfg(test)]
    pub fn with_ttl(store: Arc<Store>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Cache a tool-call signature. Empty ids or signatures are ignored.
    pub async fn cache_signature(&self, tool_use_id: &str, signature: &str) {
        if tool_use_id.is_empty() || signature.is_empty() {
            return;
        }
        self.store
            .put_raw(
                &format!("{}{tool_use_id}", prefix::SIG),
                signature.to_string(),
                Some(self.ttl),
            )
            .await;
    }

    /// Look up a cached tool-call signature.
    pub async fn get_cached_signature(&self, tool_use_id: &str) -> Option<String> {
        if tool_use_id.is_empty() {
            return None;
        }
        self.store
            .get_raw(&format!("{}{tool_use_id}", prefix::SIG))
            .await
    }

    /// Record which model family produced a thinking signature. Signatures
    /// shorter than the signed threshold are not worth tracking.
    pub async fn cache_thinking_signature(&self, signature: &str, family: ModelFamily) {
        if signature.len() < MIN_SIGNATURE_LENGTH {
            return;
        }
        self.store
            .put_raw(
                &format!("{}{signature}", prefix::THINKSIG),
                family.to_string(),
                Some(self.ttl),
            )
            .await;
    }

    /// Look up the model family a signature belongs to.
    pub async fn get_cached_family(&self, signature: &str) -> Option<ModelFamily> {
        if signature.len() < MIN_SIGNATURE_LENGTH {
            return None;
        }
        let raw = self
            .store
            .get_raw(&format!("{}{signature}", prefix::THINKSIG))
            .await?;
        match raw.as_str() {
            "claude" => Some(ModelFamily::Claude),
            "gemini" => Some(ModelFamily::Gemini),
            _ => None,
        }
    }

    /// Whether a signature may be forwarded to the target family.
    ///
    /// Claude validates its own signatures, so anything signed passes; for
    /// Gemini only signatures known to originate from Gemini are accepted.
    pub async fn is_compatible(&self, signature: &str, target: ModelFamily) -> bool {
        if target == ModelFamily::Claude {
            return true;
        }
        self.get_cached_family(signature).await == Some(ModelFamily::Gemini)
    }
}
