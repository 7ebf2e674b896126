//! Thompson-sampling arm selection, plain and contextual.
//!
//! Sampling is a pure function of the stored seed: `choose` seeds a
//! `SmallRng` from the current seed, draws one Beta sample per arm, then
//! advances the seed deterministically so repeated calls diverge while a
//! reloaded state replays identically.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use warden_common::sha256_of_value;

pub const BANDIT_STATE_SCHEMA: &str = "warden.bandit_state.v1";
pub const CONTEXTUAL_STATE_SCHEMA: &str = "warden.contextual_bandit_state.v1";

const SEED_INCREMENT: u64 = 0x9e37_79b9_7f4a_7c15;

#[derive(Debug, thiserror::Error)]
pub enum BanditError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("state_invalid: {0}")]
    Invalid(String),
}

/// Beta-distributed success estimate for one arm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetaArm {
    pub alpha: f64,
    pub beta: f64,
    pub pulls: u64,
    pub total_reward: f64,
}

impl Default for BetaArm {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
            pulls: 0,
            total_reward: 0.0,
        }
    }
}

impl BetaArm {
    pub fn seeded(alpha: f64, beta: f64) -> Self {
        Self {
            alpha,
            beta,
            pulls: 0,
            total_reward: 0.0,
        }
    }

    /// The only mutation path: fold in one reward in [0, 1].
    pub fn update(&mut self, reward: f64) {
        let r = reward.clamp(0.0, 1.0);
        self.alpha += r;
        self.beta += 1.0 - r;
        self.pulls += 1;
        self.total_reward += r;
    }

    pub fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }
}

// --- deterministic Beta sampling from uniform draws ---

fn normal_sample(rng: &mut SmallRng) -> f64 {
    // Box-Muller; 1 - gen() keeps the log argument away from zero.
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

fn gamma_sample(rng: &mut SmallRng, shape: f64) -> f64 {
    // Marsaglia-Tsang; the shape < 1 case boosts through shape + 1.
    if shape < 1.0 {
        let u: f64 = 1.0 - rng.gen::<f64>();
        return gamma_sample(rng, shape + 1.0) * u.powf(1.0 / shape);
    }
    let d = shape - 1.0 / 3.0;
    let c = 1.0 / (9.0 * d).sqrt();
    loop {
        let x = normal_sample(rng);
        let v = (1.0 + c * x).powi(3);
        if v <= 0.0 {
            continue;
        }
        let u: f64 = 1.0 - rng.gen::<f64>();
        if u < 1.0 - 0.0331 * x.powi(4) {
            return d * v;
        }
        if u.ln() < 0.5 * x * x + d * (1.0 - v + v.ln()) {
            return d * v;
        }
    }
}

fn beta_sample(rng: &mut SmallRng, alpha: f64, beta: f64) -> f64 {
    let x = gamma_sample(rng, alpha);
    let y = gamma_sample(rng, beta);
    if x + y == 0.0 {
        return 0.5;
    }
    x / (x + y)
}

fn thompson_choose(
    arms: &mut BTreeMap<String, BetaArm>,
    seed: &mut u64,
    arm_ids: &[&str],
) -> Option<String> {
    if arm_ids.is_empty() {
        return None;
    }
    let mut rng = SmallRng::seed_from_u64(*seed);
    *seed = seed.wrapping_add(SEED_INCREMENT);

    let mut best: Option<(&str, f64)> = None;
    for &id in arm_ids {
        let arm = arms.entry(id.to_string()).or_default();
        let sample = beta_sample(&mut rng, arm.alpha, arm.beta);
        match best {
            Some((_, best_sample)) if sample <= best_sample => {}
            _ => best = Some((id, sample)),
        }
    }
    best.map(|(id, _)| id.to_string())
}

/// Plain Thompson sampler over a flat arm map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThompsonSampler {
    pub seed: u64,
    pub arms: BTreeMap<String, BetaArm>,
}

impl ThompsonSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            arms: BTreeMap::new(),
        }
    }

    /// Seed one arm's prior directly (warm start from the outcome store).
    pub fn seed_arm(&mut self, arm_id: &str, alpha: f64, beta: f64) {
        self.arms
            .insert(arm_id.to_string(), BetaArm::seeded(alpha, beta));
    }

    /// Draw one Beta sample per arm and return the argmax. Ties keep the
    /// first arm in input order.
    pub fn choose(&mut self, arm_ids: &[&str]) -> Option<String> {
        thompson_choose(&mut self.arms, &mut self.seed, arm_ids)
    }

    pub fn update(&mut self, arm_id: &str, reward: f64) {
        self.arms.entry(arm_id.to_string()).or_default().update(reward);
    }

    pub fn arm(&self, arm_id: &str) -> Option<&BetaArm> {
        self.arms.get(arm_id)
    }

    pub fn save(&self, path: &Path) -> Result<(), BanditError> {
        save_state(path, BANDIT_STATE_SCHEMA, self)
    }

    pub fn load(path: &Path) -> Result<Self, BanditError> {
        load_state(path, BANDIT_STATE_SCHEMA)
    }
}

/// Coarse task features the contextual sampler buckets by. Stable hash,
/// stable buckets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFeatures {
    pub repo: String,
    pub language: String,
    pub has_trace: bool,
    pub error_signature_prefix: String,
}

impl TaskFeatures {
    /// Deterministic bucket id: canonical hash of the feature set.
    pub fn bucket_id(&self) -> String {
        let value = serde_json::json!({
            "repo": self.repo,
            "language": self.language,
            "has_trace": self.has_trace,
            "error_signature_prefix": self.error_signature_prefix,
        });
        sha256_of_value(&value).unwrap_or_default()
    }
}

/// Injected similarity lookup for seeding never-seen buckets. The core
/// ships no real implementation; tests inject stubs.
pub trait NeighborLookup {
    fn nearest(&self, features: &TaskFeatures) -> Option<String>;
}

/// Lookup that never finds a neighbor: new buckets start uniform.
pub struct NoNeighborLookup;

impl NeighborLookup for NoNeighborLookup {
    fn nearest(&self, _features: &TaskFeatures) -> Option<String> {
        None
    }
}

/// Contextual variant: one arm map per feature bucket, one shared seed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextualSampler {
    pub seed: u64,
    pub buckets: BTreeMap<String, BTreeMap<String, BetaArm>>,
}

impl ContextualSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            buckets: BTreeMap::new(),
        }
    }

    /// Choose within the feature bucket. A never-seen bucket may first be
    /// seeded by copying the arm state of a close-enough neighbor.
    pub fn choose(
        &mut self,
        features: &TaskFeatures,
        arm_ids: &[&str],
        lookup: &dyn NeighborLookup,
    ) -> Option<String> {
        let bucket_id = features.bucket_id();
        if !self.buckets.contains_key(&bucket_id) {
            if let Some(neighbor) = lookup.nearest(features) {
                if let Some(arms) = self.buckets.get(&neighbor).cloned() {
                    self.buckets.insert(bucket_id.clone(), arms);
                }
            }
        }
        let arms = self.buckets.entry(bucket_id).or_default();
        thompson_choose(arms, &mut self.seed, arm_ids)
    }

    pub fn update(&mut self, features: &TaskFeatures, arm_id: &str, reward: f64) {
        self.buckets
            .entry(features.bucket_id())
            .or_default()
            .entry(arm_id.to_string())
            .or_default()
            .update(reward);
    }

    pub fn save(&self, path: &Path) -> Result<(), BanditError> {
        save_state(path, CONTEXTUAL_STATE_SCHEMA, self)
    }

    pub fn load(path: &Path) -> Result<Self, BanditError> {
        load_state(path, CONTEXTUAL_STATE_SCHEMA)
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedState<T> {
    schema: String,
    state: T,
}

fn save_state<T: Serialize>(path: &Path, schema: &str, state: &T) -> Result<(), BanditError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let doc = PersistedState {
        schema: schema.to_string(),
        state,
    };
    let bytes =
        serde_json::to_vec_pretty(&doc).map_err(|e| BanditError::Invalid(e.to_string()))?;
    fs::write(path, bytes)?;
    Ok(())
}

fn load_state<T: serde::de::DeserializeOwned>(path: &Path, schema: &str) -> Result<T, BanditError> {
    let bytes = fs::read(path)?;
    let doc: PersistedState<T> =
        serde_json::from_slice(&bytes).map_err(|e| BanditError::Invalid(e.to_string()))?;
    if doc.schema != schema {
        return Err(BanditError::Invalid(format!(
            "schema {} is not {}",
            doc.schema, schema
        )));
    }
    Ok(doc.state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_moves_the_posterior() {
        let mut arm = BetaArm::default();
        arm.update(1.0);
        arm.update(1.0);
        arm.update(0.0);
        assert!((arm.alpha - 3.0).abs() < 1e-9);
        assert!((arm.beta - 2.0).abs() < 1e-9);
        assert_eq!(arm.pulls, 3);
        assert!((arm.mean() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn rewards_are_clamped() {
        let mut arm = BetaArm::default();
        arm.update(7.0);
        assert!((arm.alpha - 2.0).abs() < 1e-9);
        arm.update(-3.0);
        assert!((arm.beta - 2.0).abs() < 1e-9);
    }

    #[test]
    fn choose_is_deterministic_per_seed_and_diverges_across_calls() {
        let arms = ["a", "b", "c"];
        let mut one = ThompsonSampler::new(42);
        let mut two = ThompsonSampler::new(42);
        let picks_one: Vec<_> = (0..20).map(|_| one.choose(&arms).unwrap()).collect();
        let picks_two: Vec<_> = (0..20).map(|_| two.choose(&arms).unwrap()).collect();
        assert_eq!(picks_one, picks_two);
        // The advancing seed must not pin every call to one arm forever
        // on a uniform prior.
        let distinct: std::collections::BTreeSet<_> = picks_one.iter().collect();
        assert!(distinct.len() > 1);
    }

    #[test]
    fn beta_samples_stay_in_unit_interval() {
        let mut rng = SmallRng::seed_from_u64(7);
        for &(a, b) in &[(1.0, 1.0), (0.5, 0.5), (30.0, 2.0), (2.0, 30.0)] {
            for _ in 0..200 {
                let s = beta_sample(&mut rng, a, b);
                assert!((0.0..=1.0).contains(&s), "sample {} for ({}, {})", s, a, b);
            }
        }
    }

    #[test]
    fn converges_to_the_better_arm() {
        let mut sampler = ThompsonSampler::new(1);
        let arms = ["good", "bad"];
        for _ in 0..200 {
            let choice = sampler.choose(&arms).unwrap();
            let reward = if choice == "good" { 1.0 } else { 0.0 };
            sampler.update(&choice, reward);
            // The unchosen arm still gets observed in this synthetic
            // setup so both posteriors move.
            let other = if choice == "good" { "bad" } else { "good" };
            let other_reward = if other == "good" { 1.0 } else { 0.0 };
            sampler.update(other, other_reward);
        }
        let good = sampler.arm("good").unwrap();
        let bad = sampler.arm("bad").unwrap();
        assert!(good.mean() > 0.9);
        assert!(bad.mean() < 0.1);

        let picks_good = (0..100)
            .filter(|_| sampler.choose(&arms).unwrap() == "good")
            .count();
        assert!(picks_good >= 95, "picked good only {}/100 times", picks_good);
    }

    #[test]
    fn contextual_buckets_are_independent() {
        let mut sampler = ContextualSampler::new(9);
        let ctx_a = TaskFeatures {
            repo: "repo-a".to_string(),
            language: "rust".to_string(),
            has_trace: true,
            error_signature_prefix: "E0502".to_string(),
        };
        let ctx_b = TaskFeatures {
            repo: "repo-b".to_string(),
            language: "python".to_string(),
            has_trace: false,
            error_signature_prefix: "AssertionError".to_string(),
        };
        for _ in 0..50 {
            sampler.update(&ctx_a, "x", 1.0);
            sampler.update(&ctx_b, "x", 0.0);
        }
        let arm_a = &sampler.buckets[&ctx_a.bucket_id()]["x"];
        let arm_b = &sampler.buckets[&ctx_b.bucket_id()]["x"];
        assert!(arm_a.mean() > 0.9);
        assert!(arm_b.mean() < 0.1);
    }

    struct FixedNeighbor(String);

    impl NeighborLookup for FixedNeighbor {
        fn nearest(&self, _features: &TaskFeatures) -> Option<String> {
            Some(self.0.clone())
        }
    }

    #[test]
    fn new_bucket_can_copy_a_neighbor() {
        let mut sampler = ContextualSampler::new(3);
        let seen = TaskFeatures {
            repo: "seen".to_string(),
            language: "rust".to_string(),
            has_trace: true,
            error_signature_prefix: "E0382".to_string(),
        };
        for _ in 0..30 {
            sampler.update(&seen, "winner", 1.0);
        }

        let fresh = TaskFeatures {
            repo: "fresh".to_string(),
            language: "rust".to_string(),
            has_trace: true,
            error_signature_prefix: "E0382".to_string(),
        };
        let lookup = FixedNeighbor(seen.bucket_id());
        sampler.choose(&fresh, &["winner", "other"], &lookup);

        let copied = &sampler.buckets[&fresh.bucket_id()]["winner"];
        assert!(copied.mean() > 0.9, "neighbor state was not copied");
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bandit.json");
        let mut sampler = ThompsonSampler::new(11);
        sampler.update("a", 1.0);
        sampler.update("b", 0.25);
        sampler.choose(&["a", "b"]);
        sampler.save(&path).unwrap();

        let restored = ThompsonSampler::load(&path).unwrap();
        assert_eq!(restored, sampler);
    }

    #[test]
    fn wrong_schema_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bandit.json");
        std::fs::write(&path, r#"{"schema":"warden.other.v1","state":{}}"#).unwrap();
        assert!(matches!(
            ThompsonSampler::load(&path),
            Err(BanditError::Invalid(_))
        ));
    }
}
