//! Capability-filtered backend selection.
//!
//! The resolver maps a logical model request to one concrete provider and
//! one backend URL. Selection is a pure filter pipeline over a provider
//! set; only the final tie-break consults the RNG, and that RNG is
//! seedable so tests are deterministic.
//!
//! Filter order: requested names → capability → context length → affinity
//! pools. An empty set after filtering is [`ResolveError::NoSatisfyingModel`]:
//! the caller learns which request could not be satisfied, never a
//! silently wrong model.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use orq_schemas::{Capabilities, Capability};
use orq_state::BackendView;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no satisfying model for request (capability {capability:?}, context {context_length:?})")]
    NoSatisfyingModel {
        capability: Capability,
        context_length: Option<i32>,
    },
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// One routable (model, backend) combination with its capabilities.
#[derive(Debug, Clone)]
pub struct Provider {
    pub model_name: String,
    pub backend_id: Uuid,
    /// A provider usually has one URL; replicas of the same backend may
    /// expose several, and the tie-break policy picks among them too.
    pub backend_urls: Vec<String>,
    pub capabilities: Capabilities,
}

/// Capability lookup for model names with a conservative fallback: embed
/// models embed, everything else chats/prompts/streams with a 4k window.
#[derive(Debug, Clone, Default)]
pub struct CapabilityCatalog {
    by_name: HashMap<String, Capabilities>,
}

impl CapabilityCatalog {
    pub fn insert(&mut self, model_name: &str, caps: Capabilities) {
        self.by_name.insert(model_name.to_string(), caps);
    }

    pub fn lookup(&self, model_name: &str) -> Capabilities {
        if let Some(caps) = self.by_name.get(model_name) {
            return *caps;
        }
        if model_name.contains("embed") {
            Capabilities {
                can_chat: false,
                can_prompt: false,
                can_embed: true,
                can_stream: false,
                context_length: 8_192,
            }
        } else {
            Capabilities {
                can_chat: true,
                can_prompt: true,
                can_embed: false,
                can_stream: true,
                context_length: 4_096,
            }
        }
    }
}

/// Derive the provider set from the observed cluster state: one provider
/// per (backend, pulled model) pair. Backends with a dial error still
/// contribute their last-known models only if `include_errored`.
pub fn providers_from_views(
    views: &HashMap<Uuid, BackendView>,
    catalog: &CapabilityCatalog,
    include_errored: bool,
) -> Vec<Provider> {
    let mut out = Vec::new();
    for view in views.values() {
        if view.error.is_some() && !include_errored {
            continue;
        }
        for model in &view.pulled_models {
            out.push(Provider {
                model_name: model.clone(),
                backend_id: view.backend.id,
                backend_urls: vec![view.backend.base_url.clone()],
                capabilities: catalog.lookup(model),
            });
        }
    }
    // Stable order before any policy shuffles.
    out.sort_by(|a, b| {
        (a.model_name.as_str(), a.backend_id).cmp(&(b.model_name.as_str(), b.backend_id))
    });
    out
}

// ---------------------------------------------------------------------------
// Affinity index
// ---------------------------------------------------------------------------

/// Pool-derived compatibility: which backends may serve which model.
///
/// Constructed from the store's (model name, backend id) association pairs.
/// With no pools configured the index is inactive and routing is
/// unconstrained.
#[derive(Debug, Clone, Default)]
pub struct AffinityIndex {
    active: bool,
    model_backends: HashMap<String, HashSet<Uuid>>,
}

impl AffinityIndex {
    pub fn inactive() -> Self {
        Self::default()
    }

    pub fn from_associations(pairs: &[(String, Uuid)]) -> Self {
        let mut model_backends: HashMap<String, HashSet<Uuid>> = HashMap::new();
        for (model, backend_id) in pairs {
            model_backends
                .entry(model.clone())
                .or_default()
                .insert(*backend_id);
        }
        Self {
            active: true,
            model_backends,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Whether `model` and `backend` share at least one pool. When the
    /// index is inactive everything is allowed; when active, unassigned
    /// resources are invisible.
    pub fn allows(&self, model: &str, backend_id: Uuid) -> bool {
        if !self.active {
            return true;
        }
        self.model_backends
            .get(model)
            .map(|s| s.contains(&backend_id))
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Requests & policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Uniform pick over the surviving candidates. Currently the only
    /// shipped policy; the enum is the extension point for more.
    #[default]
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveRequest {
    /// Acceptable model names; empty means any model.
    #[serde(default)]
    pub model_names: Vec<String>,
    pub capability: Capability,
    #[serde(default)]
    pub context_length: Option<i32>,
    #[serde(default)]
    pub policy: SelectionPolicy,
}

/// The resolver's answer: one provider, one URL.
#[derive(Debug, Clone)]
pub struct Selection {
    pub provider: Provider,
    pub backend_url: String,
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

pub struct Resolver {
    rng: Mutex<StdRng>,
}

impl Default for Resolver {
    fn default() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic resolver for tests and replayable routing decisions.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn resolve(
        &self,
        providers: &[Provider],
        affinity: &AffinityIndex,
        req: &ResolveRequest,
    ) -> Result<Selection, ResolveError> {
        let no_match = || ResolveError::NoSatisfyingModel {
            capability: req.capability,
            context_length: req.context_length,
        };

        let candidates: Vec<&Provider> = providers
            .iter()
            .filter(|p| req.model_names.is_empty() || req.model_names.contains(&p.model_name))
            .filter(|p| p.capabilities.supports(req.capability))
            .filter(|p| match req.context_length {
                Some(needed) => p.capabilities.context_length >= needed,
                None => true,
            })
            .filter(|p| affinity.allows(&p.model_name, p.backend_id))
            .filter(|p| !p.backend_urls.is_empty())
            .collect();

        if candidates.is_empty() {
            return Err(no_match());
        }

        let mut rng = self.rng.lock().expect("resolver rng mutex poisoned");
        let provider = match req.policy {
            SelectionPolicy::Random => *candidates
                .choose(&mut *rng)
                .expect("non-empty candidate set"),
        };
        let backend_url = match req.policy {
            SelectionPolicy::Random => provider
                .backend_urls
                .choose(&mut *rng)
                .expect("non-empty url set")
                .clone(),
        };

        Ok(Selection {
            provider: provider.clone(),
            backend_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(name: &str, caps: Capabilities) -> Provider {
        Provider {
            model_name: name.to_string(),
            backend_id: Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()),
            backend_urls: vec![format!("http://{name}:11434")],
            capabilities: caps,
        }
    }

    fn chat_128k() -> Capabilities {
        Capabilities {
            can_chat: true,
            can_prompt: true,
            can_embed: false,
            can_stream: true,
            context_length: 128_000,
        }
    }

    fn embed_8k() -> Capabilities {
        Capabilities {
            can_chat: false,
            can_prompt: false,
            can_embed: true,
            can_stream: false,
            context_length: 8_192,
        }
    }

    fn fixture() -> Vec<Provider> {
        vec![
            provider("gpt-4o", chat_128k()),
            provider("text-embedding-3-small", embed_8k()),
        ]
    }

    fn request(capability: Capability, context_length: Option<i32>) -> ResolveRequest {
        ResolveRequest {
            model_names: vec![],
            capability,
            context_length,
            policy: SelectionPolicy::Random,
        }
    }

    #[test]
    fn embed_request_selects_the_embedding_model() {
        let r = Resolver::with_seed(7);
        let sel = r
            .resolve(
                &fixture(),
                &AffinityIndex::inactive(),
                &request(Capability::Embed, Some(4_096)),
            )
            .expect("resolves");
        assert_eq!(sel.provider.model_name, "text-embedding-3-small");
    }

    #[test]
    fn oversized_context_yields_no_satisfying_model() {
        let r = Resolver::with_seed(7);
        let err = r
            .resolve(
                &fixture(),
                &AffinityIndex::inactive(),
                &request(Capability::Chat, Some(200_000)),
            )
            .unwrap_err();
        assert!(matches!(err, ResolveError::NoSatisfyingModel { .. }));
    }

    #[test]
    fn name_filter_restricts_candidates() {
        let r = Resolver::with_seed(7);
        let mut req = request(Capability::Chat, None);
        req.model_names = vec!["gpt-4o".to_string()];
        let sel = r
            .resolve(&fixture(), &AffinityIndex::inactive(), &req)
            .expect("resolves");
        assert_eq!(sel.provider.model_name, "gpt-4o");

        req.model_names = vec!["unknown-model".to_string()];
        assert!(r
            .resolve(&fixture(), &AffinityIndex::inactive(), &req)
            .is_err());
    }

    #[test]
    fn active_affinity_hides_unassigned_pairs() {
        let providers = fixture();
        let chat_backend = providers[0].backend_id;

        // Only gpt-4o is pooled; the embed model is unassigned and invisible.
        let affinity =
            AffinityIndex::from_associations(&[("gpt-4o".to_string(), chat_backend)]);

        let r = Resolver::with_seed(7);
        assert!(r
            .resolve(&providers, &affinity, &request(Capability::Chat, None))
            .is_ok());
        assert!(r
            .resolve(&providers, &affinity, &request(Capability::Embed, None))
            .is_err());
    }

    #[test]
    fn url_pick_comes_from_the_selected_provider() {
        let mut p = provider("gpt-4o", chat_128k());
        p.backend_urls = vec![
            "http://replica-a:11434".to_string(),
            "http://replica-b:11434".to_string(),
        ];

        let r = Resolver::with_seed(42);
        let sel = r
            .resolve(
                &[p.clone()],
                &AffinityIndex::inactive(),
                &request(Capability::Chat, None),
            )
            .expect("resolves");
        assert!(p.backend_urls.contains(&sel.backend_url));
    }

    #[test]
    fn seeded_resolution_is_deterministic() {
        let providers = vec![
            provider("llama3:8b", chat_128k()),
            provider("mistral:7b", chat_128k()),
            provider("qwen2:7b", chat_128k()),
        ];
        let req = request(Capability::Chat, None);

        let a: Vec<String> = (0..8)
            .map(|_| {
                Resolver::with_seed(99)
                    .resolve(&providers, &AffinityIndex::inactive(), &req)
                    .map(|s| s.provider.model_name)
                    .unwrap_or_default()
            })
            .collect();
        assert!(a.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn catalog_fallback_distinguishes_embed_models() {
        let catalog = CapabilityCatalog::default();
        assert!(catalog.lookup("nomic-embed-text:latest").can_embed);
        assert!(!catalog.lookup("nomic-embed-text:latest").can_chat);
        assert!(catalog.lookup("llama3:8b").can_chat);
    }
}
