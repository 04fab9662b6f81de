//! Tool selection across planner and worker categories.
//!
//! Resolution order for `select`: force override, active profile, category
//! (with `meta` fallback), availability and cooldown filter, then strategy.
//! Cooldown deadlines, round-robin cursors and the RNG share one mutex.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use runner_core::tooling::{CategoryConfig, Strategy, ToolCandidate, ToolingConfig};
use tokio::time::Instant;
use tracing::{debug, info};

pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Decides whether a candidate can run on this host.
pub trait Availability: Send + Sync {
    fn is_available(&self, candidate: &ToolCandidate) -> bool;
}

/// Checks API keys and PATH at call time.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostAvailability;

impl Availability for HostAvailability {
    fn is_available(&self, candidate: &ToolCandidate) -> bool {
        match candidate.tool.as_str() {
            "mock" => true,
            "openai-chat" => std::env::var(OPENAI_API_KEY_ENV).is_ok_and(|v| !v.trim().is_empty()),
            _ => binary_on_path(candidate.binary_name()),
        }
    }
}

/// True if `binary` is an existing path or resolves through `PATH`.
pub fn binary_on_path(binary: &str) -> bool {
    if binary.is_empty() {
        return false;
    }
    if binary.contains(std::path::MAIN_SEPARATOR) {
        return is_executable(Path::new(binary));
    }
    std::env::var_os("PATH").is_some_and(|paths| {
        std::env::split_paths(&paths).any(|dir| is_executable(&dir.join(binary)))
    })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[derive(Debug)]
struct SelectorState {
    /// category -> candidate key -> cooldown deadline
    cooldowns: HashMap<String, HashMap<String, Instant>>,
    round_robin: HashMap<String, usize>,
    rng: StdRng,
}

impl SelectorState {
    fn cooling(&self, category: &str, key: &str, now: Instant) -> bool {
        self.cooldowns
            .get(category)
            .and_then(|keys| keys.get(key))
            .is_some_and(|deadline| *deadline > now)
    }

    fn next_round_robin(&mut self, category: &str, len: usize) -> usize {
        let cursor = self.round_robin.entry(category.to_string()).or_insert(0);
        let index = if *cursor >= len { 0 } else { *cursor };
        *cursor = (index + 1) % len;
        index
    }

    fn pick_weighted(&mut self, candidates: &[&ToolCandidate]) -> usize {
        let total = candidates
            .iter()
            .map(|c| c.effective_weight())
            .fold(0u64, u64::saturating_add);
        if total == 0 {
            return 0;
        }
        let mut roll = self.rng.gen_range(0..total);
        for (index, candidate) in candidates.iter().enumerate() {
            let weight = candidate.effective_weight();
            if roll < weight {
                return index;
            }
            roll -= weight;
        }
        0
    }
}

/// Picks a candidate per category.
pub struct Selector {
    config: ToolingConfig,
    availability: Box<dyn Availability>,
    state: Mutex<SelectorState>,
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Selector {
    pub fn new(config: ToolingConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Deterministic weighted draws for tests.
    pub fn with_seed(config: ToolingConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: ToolingConfig, rng: StdRng) -> Self {
        Self {
            config,
            availability: Box::new(HostAvailability),
            state: Mutex::new(SelectorState {
                cooldowns: HashMap::new(),
                round_robin: HashMap::new(),
                rng,
            }),
        }
    }

    pub fn with_availability(mut self, availability: impl Availability + 'static) -> Self {
        self.availability = Box::new(availability);
        self
    }

    pub fn config(&self) -> &ToolingConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, SelectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn category(&self, category: &str) -> Option<&CategoryConfig> {
        self.config.resolve_profile()?.category(category)
    }

    /// Next candidate for `category`, or `None` when nothing is eligible.
    pub fn select(&self, category: &str) -> Option<ToolCandidate> {
        if let Some(forced) = self.config.forced_candidate() {
            debug!(category, tool = %forced.tool, "force override selected");
            return Some(forced);
        }

        let config = self.category(category)?;
        let mut state = self.lock();
        let now = Instant::now();
        let eligible: Vec<&ToolCandidate> = config
            .candidates
            .iter()
            .filter(|c| self.availability.is_available(c) && !state.cooling(category, &c.key(), now))
            .collect();

        if eligible.is_empty() {
            debug!(category, "no eligible candidates");
            return None;
        }

        let index = match config.strategy {
            Strategy::RoundRobin => state.next_round_robin(category, eligible.len()),
            Strategy::Weighted => state.pick_weighted(&eligible),
        };
        let chosen = eligible[index].clone();
        debug!(
            category,
            strategy = config.strategy.as_str(),
            candidate = %chosen.key(),
            "candidate selected"
        );
        Some(chosen)
    }

    /// Exclude `candidate` from `category` for `cooldown_sec` (0 means default).
    pub fn mark_rate_limited(&self, category: &str, candidate: &ToolCandidate, cooldown_sec: u64) {
        let cooldown_sec = if cooldown_sec == 0 {
            runner_core::tooling::DEFAULT_COOLDOWN_SEC
        } else {
            cooldown_sec
        };
        let deadline = Instant::now() + Duration::from_secs(cooldown_sec);
        let key = candidate.key();
        info!(category, candidate = %key, cooldown_sec, "candidate rate limited; cooling down");
        self.lock()
            .cooldowns
            .entry(category.to_string())
            .or_default()
            .insert(key, deadline);
    }

    /// Configured candidates for `category`, after profile and `meta` fallback.
    pub fn candidate_count(&self, category: &str) -> usize {
        self.category(category).map_or(0, |c| c.candidates.len())
    }

    pub fn should_fallback_on_rate_limit(&self, category: &str) -> bool {
        self.category(category)
            .is_some_and(|c| c.fallback_on_rate_limit)
    }

    pub fn cooldown_sec(&self, category: &str) -> u64 {
        self.category(category)
            .map_or(runner_core::tooling::DEFAULT_COOLDOWN_SEC, CategoryConfig::effective_cooldown_sec)
    }

    /// Record a rate-limited failure if the category opts into fallback.
    ///
    /// Returns whether a cooldown was installed.
    pub fn report_failure(&self, category: &str, candidate: &ToolCandidate, error: &str) -> bool {
        if !runner_core::is_rate_limit_message(error) || !self.should_fallback_on_rate_limit(category) {
            return false;
        }
        self.mark_rate_limited(category, candidate, self.cooldown_sec(category));
        true
    }
}
