//! Health and availability probe.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::fallback::FallbackEngine;
use crate::language::{Language, LanguageRegistry};
use crate::runtime::{ContainerRuntime, RuntimeError};

/// Probe caching and time limits.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// How long a runtime liveness answer (or a failed image check) is reused.
    pub ttl: Duration,
    /// Limit on one liveness call.
    pub info_timeout: Duration,
    /// Limit on one image inspect-or-pull.
    pub pull_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            info_timeout: Duration::from_secs(5),
            pull_timeout: Duration::from_secs(600),
        }
    }
}

/// Last image check for one image; its lock serializes pulls of that image.
type ImageSlot = Arc<Mutex<Option<(bool, Instant)>>>;

/// Result of a runtime liveness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeHealth {
    pub available: bool,
    pub detail: String,
}

/// Where a language currently executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Docker,
    Fallback,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageStatus {
    pub id: String,
    pub name: String,
    pub available: bool,
    pub mode: ExecutionMode,
}

/// Body of `GET health` and `GET docker-status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// `"ok"` when the runtime answers, `"error"` otherwise.
    pub status: String,
    pub docker_available: bool,
    pub details: String,
    #[serde(default)]
    pub fallback_enabled: bool,
}

/// Answers "can this language run in a container right now?".
///
/// Never raises: every runtime error is reported as unavailability.
pub struct HealthProbe {
    runtime: Arc<dyn ContainerRuntime>,
    languages: Arc<LanguageRegistry>,
    fallback_enabled: bool,
    config: ProbeConfig,
    runtime_cache: Mutex<Option<(RuntimeHealth, Instant)>>,
    /// Image checks: successes are kept, failures expire after the ttl.
    images: Mutex<HashMap<String, ImageSlot>>,
}

impl HealthProbe {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        languages: Arc<LanguageRegistry>,
        fallback_enabled: bool,
        config: ProbeConfig,
    ) -> Self {
        Self {
            runtime,
            languages,
            fallback_enabled,
            config,
            runtime_cache: Mutex::new(None),
            images: Mutex::new(HashMap::new()),
        }
    }

    /// Liveness of the container runtime. `force` bypasses the cache.
    ///
    /// The cache lock is never held across the runtime call; concurrent
    /// misses may probe twice.
    pub async fn check_runtime(&self, force: bool) -> RuntimeHealth {
        if !force {
            if let Some((health, at)) = self.runtime_cache.lock().await.as_ref() {
                if at.elapsed() < self.config.ttl {
                    return health.clone();
                }
            }
        }

        let answer = tokio::time::timeout(self.config.info_timeout, self.runtime.info())
            .await
            .unwrap_or_else(|_| {
                Err(RuntimeError::Unavailable(format!(
                    "no answer within {} ms",
                    self.config.info_timeout.as_millis()
                )))
            });
        let health = match answer {
            Ok(info) => RuntimeHealth {
                available: true,
                detail: format!(
                    "Docker {} (API {}) is available",
                    info.version, info.api_version
                ),
            },
            Err(e) => {
                warn!(error = %e, "Container runtime unavailable");
                RuntimeHealth {
                    available: false,
                    detail: e.to_string(),
                }
            }
        };
        *self.runtime_cache.lock().await = Some((health.clone(), Instant::now()));
        health
    }

    /// Whether `language` can run in a container: the runtime answers and
    /// the profile image is present (pulled on first use).
    pub async fn check_language(&self, language: Language) -> bool {
        if !self.check_runtime(false).await.available {
            return false;
        }
        let Some(profile) = self.languages.get(language) else {
            return false;
        };

        let image = &profile.base_image;
        let slot = Arc::clone(self.images.lock().await.entry(image.clone()).or_default());
        let mut last = slot.lock().await;
        if let Some((ok, at)) = *last {
            if ok || at.elapsed() < self.config.ttl {
                return ok;
            }
        }

        let pull = tokio::time::timeout(self.config.pull_timeout, self.runtime.ensure_image(image));
        let ok = match pull.await {
            Ok(Ok(())) => {
                debug!(image = %image, "Image ready");
                true
            }
            Ok(Err(e)) => {
                warn!(image = %image, error = %e, "Image unavailable");
                false
            }
            Err(_) => {
                warn!(image = %image, timeout = ?self.config.pull_timeout, "Image pull timed out");
                false
            }
        };
        *last = Some((ok, Instant::now()));
        ok
    }

    /// Availability of every configured language.
    pub async fn supported_languages(&self) -> Vec<LanguageStatus> {
        let runtime_up = self.check_runtime(false).await.available;
        let mut statuses: Vec<LanguageStatus> = self
            .languages
            .iter()
            .map(|profile| {
                let language = profile.language;
                let mode = if runtime_up {
                    ExecutionMode::Docker
                } else if self.fallback_enabled && FallbackEngine::supports(language) {
                    ExecutionMode::Fallback
                } else {
                    ExecutionMode::Unavailable
                };
                LanguageStatus {
                    id: language.id().to_string(),
                    name: language.display_name().to_string(),
                    available: mode != ExecutionMode::Unavailable,
                    mode,
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    pub async fn report(&self, force: bool) -> HealthReport {
        let health = self.check_runtime(force).await;
        HealthReport {
            status: if health.available { "ok" } else { "error" }.to_string(),
            docker_available: health.available,
            details: health.detail,
            fallback_enabled: self.fallback_enabled,
        }
    }
}
