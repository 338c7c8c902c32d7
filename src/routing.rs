//! Model routing: which provider and model serve a request.

use serde::Serialize;

use crate::config::{ProxyConfig, RouteConfig};
use crate::translate::Format;

/// Shortest key or model name the loose containment match accepts.
const MIN_PARTIAL_MATCH: usize = 3;

/// Where one request goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteDecision {
    pub source_format: Format,
    pub target_provider: String,
    pub target_model: String,
    /// Pin a specific key from the provider's pool.
    pub credential_ref: Option<String>,
    pub api_base_override: Option<String>,
}

pub trait RouteResolver: Send + Sync {
    /// `None` lets the dispatcher fall back to the configured default.
    fn resolve_route(
        &self,
        source_format: Format,
        requested_model: &str,
        prompt_hint: Option<&str>,
    ) -> Option<RouteDecision>;
}

/// Route table loaded from `[[routes]]`.
///
/// Resolution order: exact route key, exact target model, prompt keyword,
/// then a loose match on provider name or route key.
#[derive(Debug, Clone, Default)]
pub struct StaticRouter {
    routes: Vec<RouteConfig>,
}

impl StaticRouter {
    pub fn new(routes: Vec<RouteConfig>) -> Self {
        Self {
            routes: routes.into_iter().filter(|r| r.enabled).collect(),
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(config.routes.clone())
    }

    pub fn routes(&self) -> &[RouteConfig] {
        &self.routes
    }

    fn find_match(&self, model: &str, prompt_hint: Option<&str>) -> Option<(&RouteConfig, bool)> {
        if let Some(route) = self.routes.iter().find(|r| r.route_key == model) {
            return Some((route, false));
        }
        if let Some(route) = self.routes.iter().find(|r| r.target_model == model) {
            return Some((route, false));
        }

        if let Some(hint) = prompt_hint.map(str::to_lowercase) {
            let by_keyword = self.routes.iter().find(|r| {
                r.keywords
                    .iter()
                    .any(|k| !k.is_empty() && hint.contains(&k.to_lowercase()))
            });
            if let Some(route) = by_keyword {
                tracing::debug!(route = %route.route_key, "routed by prompt keyword");
                return Some((route, false));
            }
        }

        if model.is_empty() {
            return None;
        }
        let lower = model.to_lowercase();
        // A model named after its provider keeps its own name.
        if let Some(route) = self
            .routes
            .iter()
            .find(|r| !r.provider.is_empty() && lower.starts_with(&r.provider.to_lowercase()))
        {
            return Some((route, true));
        }
        // Loose match: the shorter of key and model must be long enough to
        // mean something, and the longest matching key wins.
        self.routes
            .iter()
            .filter(|r| {
                let key = r.route_key.to_lowercase();
                let shorter = key.len().min(lower.len());
                shorter >= MIN_PARTIAL_MATCH && (lower.contains(&key) || key.contains(&lower))
            })
            .max_by_key(|r| r.route_key.len())
            .map(|r| (r, false))
    }
}

impl RouteResolver for StaticRouter {
    fn resolve_route(
        &self,
        source_format: Format,
        requested_model: &str,
        prompt_hint: Option<&str>,
    ) -> Option<RouteDecision> {
        let (route, keep_model) = self.find_match(requested_model, prompt_hint)?;
        Some(RouteDecision {
            source_format,
            target_provider: route.provider.clone(),
            target_model: if keep_model {
                requested_model.to_string()
            } else {
                route.target_model.clone()
            },
            credential_ref: route.credential.clone(),
            api_base_override: route.api_base.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(key: &str, provider: &str, target: &str, keywords: &[&str]) -> RouteConfig {
        RouteConfig {
            route_key: key.to_string(),
            provider: provider.to_string(),
            target_model: target.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            api_base: None,
            credential: None,
            enabled: true,
        }
    }

    fn router() -> StaticRouter {
        StaticRouter::new(vec![
            route("smart", "anthropic", "claude-3-opus-20240229", &[]),
            route("fast", "gemini", "gemini-2.0-flash", &["summarize"]),
            route("coder", "deepseek", "deepseek-coder", &[]),
        ])
    }

    fn target(r: &StaticRouter, model: &str, hint: Option<&str>) -> Option<(String, String)> {
        r.resolve_route(Format::OpenAi, model, hint)
            .map(|d| (d.target_provider, d.target_model))
    }

    #[test]
    fn test_exact_route_key_then_target_model() {
        let r = router();
        assert_eq!(
            target(&r, "smart", None),
            Some(("anthropic".into(), "claude-3-opus-20240229".into()))
        );
        assert_eq!(
            target(&r, "gemini-2.0-flash", None),
            Some(("gemini".into(), "gemini-2.0-flash".into()))
        );
    }

    #[test]
    fn test_prompt_keyword() {
        let r = router();
        assert_eq!(
            target(&r, "gpt-4o", Some("Please SUMMARIZE this article")),
            Some(("gemini".into(), "gemini-2.0-flash".into()))
        );
    }

    #[test]
    fn test_provider_prefix_keeps_model() {
        let r = router();
        assert_eq!(
            target(&r, "deepseek-chat", None),
            Some(("deepseek".into(), "deepseek-chat".into()))
        );
    }

    #[test]
    fn test_partial_route_key() {
        let r = router();
        assert_eq!(
            target(&r, "fast-v2", None),
            Some(("gemini".into(), "gemini-2.0-flash".into()))
        );
    }

    #[test]
    fn test_partial_match_ignores_short_names_and_prefers_longest_key() {
        let r = StaticRouter::new(vec![
            route("", "openai", "gpt-4o", &[]),
            route("gpt", "openai", "gpt-4o-mini", &[]),
            route("gpt-4-turbo", "openai", "gpt-4-turbo-2024-04-09", &[]),
        ]);
        assert_eq!(
            target(&r, "my-gpt-4-turbo-preview", None),
            Some(("openai".into(), "gpt-4-turbo-2024-04-09".into()))
        );
        assert_eq!(
            target(&r, "gpt-3.5", None),
            Some(("openai".into(), "gpt-4o-mini".into()))
        );
        // An empty key or a one-letter model matches nothing.
        assert_eq!(target(&r, "x", None), None);
        assert_eq!(target(&r, "claude", None), None);
    }

    #[test]
    fn test_route_pins_credential() {
        let mut pinned = route("batch", "openai", "gpt-4o-mini", &[]);
        pinned.credential = Some("openai-batch".to_string());
        let r = StaticRouter::new(vec![pinned]);
        let decision = r.resolve_route(Format::Claude, "batch", None).unwrap();
        assert_eq!(decision.credential_ref.as_deref(), Some("openai-batch"));
        assert_eq!(
            router().resolve_route(Format::Claude, "smart", None).unwrap().credential_ref,
            None
        );
    }

    #[test]
    fn test_no_match_and_disabled_routes() {
        let mut disabled = route("gpt-4o", "openai", "gpt-4o", &[]);
        disabled.enabled = false;
        let r = StaticRouter::new(vec![disabled]);
        assert!(r.routes().is_empty());
        assert_eq!(target(&r, "gpt-4o", None), None);
        assert_eq!(target(&router(), "llama-3", None), None);
    }
}
