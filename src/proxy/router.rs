//! Cluster routing: round-robin selection for probing and health-aware
//! random selection for the forward path.

use std::collections::HashMap;
use std::sync::Mutex;

use rand::Rng;

use crate::config::{Config, Target};
use crate::error::{ProxyError, Result};

/// Uniform pick seam so tests can inject a fixed sequence.
pub trait TargetRandSource: Send + Sync {
    fn pick(&self, n: usize) -> usize;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRngSource;

impl TargetRandSource for ThreadRngSource {
    fn pick(&self, n: usize) -> usize {
        rand::thread_rng().gen_range(0..n)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RouterStats {
    pub default_cluster_id: i32,
    pub clusters: usize,
    pub targets: usize,
}

#[derive(Debug, Clone)]
pub struct ChooseResult {
    pub target: Target,
    pub requested_cluster: i32,
    pub resolved_cluster_id: i32,
    pub used_default: bool,
}

#[derive(Default)]
struct RouterState {
    default_cluster_id: i32,
    clusters: HashMap<i32, Vec<Target>>,
    next_index: HashMap<i32, usize>,
}

pub struct Router {
    state: Mutex<RouterState>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Router {
            state: Mutex::new(RouterState::default()),
        }
    }

    /// Replace the routing table. Round-robin pointers reset.
    pub fn update(&self, cfg: &Config) {
        let mut state = self.state.lock().expect("router lock");
        state.default_cluster_id = cfg.default_cluster_id;
        state.clusters = cfg
            .clusters
            .iter()
            .map(|c| (c.id, c.targets.clone()))
            .collect();
        state.next_index = cfg.clusters.iter().map(|c| (c.id, 0)).collect();
    }

    pub fn stats(&self) -> RouterStats {
        let state = self.state.lock().expect("router lock");
        RouterStats {
            default_cluster_id: state.default_cluster_id,
            clusters: state.clusters.len(),
            targets: state.clusters.values().map(Vec::len).sum(),
        }
    }

    /// Round-robin pick; errors when the cluster is absent or empty.
    pub fn select(&self, cluster_id: i32) -> Result<Target> {
        let mut state = self.state.lock().expect("router lock");
        let (resolved, _) = resolve_cluster(&state, cluster_id, false)?;
        Ok(select_round_robin(&mut state, resolved))
    }

    /// Round-robin pick, resolving an absent cluster to the default.
    pub fn select_with_default(&self, cluster_id: i32) -> Result<Target> {
        let mut state = self.state.lock().expect("router lock");
        let (resolved, _) = resolve_cluster(&state, cluster_id, true)?;
        Ok(select_round_robin(&mut state, resolved))
    }

    pub fn select_default(&self) -> Result<Target> {
        let mut state = self.state.lock().expect("router lock");
        let (resolved, _) = resolve_cluster(&state, state.default_cluster_id, false)?;
        Ok(select_round_robin(&mut state, resolved))
    }

    pub fn choose_proxy_target(
        &self,
        cluster_id: i32,
        attempts: usize,
        is_healthy: &dyn Fn(&Target) -> bool,
        rnd: &dyn TargetRandSource,
    ) -> Result<Target> {
        self.choose_proxy_target_detailed(cluster_id, attempts, is_healthy, rnd)
            .map(|res| res.target)
    }

    /// Up to `attempts` uniform random picks, returning the first healthy
    /// target. `used_default` is set only when the requested cluster was
    /// absent and the default cluster answered instead.
    pub fn choose_proxy_target_detailed(
        &self,
        cluster_id: i32,
        attempts: usize,
        is_healthy: &dyn Fn(&Target) -> bool,
        rnd: &dyn TargetRandSource,
    ) -> Result<ChooseResult> {
        let state = self.state.lock().expect("router lock");
        let (resolved, used_default) = resolve_cluster(&state, cluster_id, true)?;
        let targets = &state.clusters[&resolved];
        let attempts = attempts.max(1);

        for _ in 0..attempts {
            let target = &targets[rnd.pick(targets.len())];
            if is_healthy(target) {
                return Ok(ChooseResult {
                    target: target.clone(),
                    requested_cluster: cluster_id,
                    resolved_cluster_id: resolved,
                    used_default,
                });
            }
        }
        Err(ProxyError::NoHealthyTargets(cluster_id))
    }
}

fn resolve_cluster(state: &RouterState, cluster_id: i32, fallback_default: bool) -> Result<(i32, bool)> {
    let original = cluster_id;
    let mut cluster_id = cluster_id;
    let mut present = non_empty(state, cluster_id);
    let mut used_default = false;
    if !present && fallback_default {
        cluster_id = state.default_cluster_id;
        present = non_empty(state, cluster_id);
        used_default = true;
    }
    if !present {
        return Err(ProxyError::ClusterNotFound(cluster_id));
    }
    if cluster_id == original {
        used_default = false;
    }
    Ok((cluster_id, used_default))
}

fn non_empty(state: &RouterState, cluster_id: i32) -> bool {
    state.clusters.get(&cluster_id).is_some_and(|t| !t.is_empty())
}

fn select_round_robin(state: &mut RouterState, cluster_id: i32) -> Target {
    let targets = &state.clusters[&cluster_id];
    let idx = state.next_index.entry(cluster_id).or_insert(0);
    if *idx >= targets.len() {
        *idx = 0;
    }
    let target = targets[*idx].clone();
    *idx = (*idx + 1) % targets.len();
    target
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Cluster;

    /// Replays a fixed pick sequence, reduced modulo the requested bound.
    pub(crate) struct SeqRand {
        seq: Vec<usize>,
        i: std::sync::atomic::AtomicUsize,
    }

    impl SeqRand {
        pub(crate) fn new(seq: Vec<usize>) -> Self {
            SeqRand {
                seq,
                i: std::sync::atomic::AtomicUsize::new(0),
            }
        }
    }

    impl TargetRandSource for SeqRand {
        fn pick(&self, n: usize) -> usize {
            if self.seq.is_empty() {
                return 0;
            }
            let i = self.i.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.seq[i % self.seq.len()] % n
        }
    }

    pub(crate) fn target(cluster_id: i32, host: &str, port: u16) -> Target {
        Target {
            cluster_id,
            host: host.to_string(),
            port,
            min_connections: 1,
            max_connections: 2,
        }
    }

    fn config(default: i32, clusters: Vec<Cluster>) -> Config {
        Config {
            default_cluster_id: default,
            clusters,
            ..Config::default()
        }
    }

    fn always_healthy(_: &Target) -> bool {
        true
    }

    #[test]
    fn round_robin_per_cluster() {
        let r = Router::new();
        r.update(&config(
            1,
            vec![Cluster {
                id: 1,
                targets: vec![target(1, "a", 1), target(1, "b", 2)],
            }],
        ));

        let hosts: Vec<String> = (0..3).map(|_| r.select(1).expect("select").host).collect();
        assert_eq!(hosts, ["a", "b", "a"]);
    }

    #[test]
    fn select_with_default_fallback() {
        let r = Router::new();
        r.update(&config(
            2,
            vec![Cluster {
                id: 2,
                targets: vec![target(2, "default", 443)],
            }],
        ));

        assert_eq!(r.select_with_default(99).expect("select").host, "default");
        assert!(r.select(99).is_err());
    }

    #[test]
    fn update_resets_round_robin_index() {
        let r = Router::new();
        let cfg = config(
            1,
            vec![Cluster {
                id: 1,
                targets: vec![target(1, "a", 1), target(1, "b", 2)],
            }],
        );
        r.update(&cfg);
        r.select(1).expect("advance pointer");
        r.update(&cfg);
        assert_eq!(r.select(1).expect("select").host, "a");
    }

    #[test]
    fn choose_respects_health_predicate() {
        let r = Router::new();
        r.update(&config(
            1,
            vec![Cluster {
                id: 1,
                targets: vec![target(1, "sick", 1), target(1, "ok", 2)],
            }],
        ));

        let rnd = SeqRand::new(vec![0, 1]);
        let res = r
            .choose_proxy_target_detailed(1, 5, &|t| t.host == "ok", &rnd)
            .expect("choose");
        assert_eq!(res.target.host, "ok");
        assert!(!res.used_default);
    }

    #[test]
    fn choose_exhausts_attempts() {
        let r = Router::new();
        r.update(&config(
            1,
            vec![Cluster {
                id: 1,
                targets: vec![target(1, "sick", 1)],
            }],
        ));

        let rnd = SeqRand::new(vec![0]);
        let err = r
            .choose_proxy_target_detailed(1, 3, &|_| false, &rnd)
            .expect_err("must exhaust");
        assert!(matches!(err, ProxyError::NoHealthyTargets(1)));
    }

    #[test]
    fn choose_used_default_flag() {
        let r = Router::new();
        r.update(&config(
            2,
            vec![Cluster {
                id: 2,
                targets: vec![target(2, "d", 443)],
            }],
        ));

        let rnd = SeqRand::new(vec![0]);
        let res = r
            .choose_proxy_target_detailed(7, 5, &always_healthy, &rnd)
            .expect("choose");
        assert!(res.used_default);
        assert_eq!(res.requested_cluster, 7);
        assert_eq!(res.resolved_cluster_id, 2);

        // Asking for the default cluster directly is not "using the default".
        let res = r
            .choose_proxy_target_detailed(2, 5, &always_healthy, &rnd)
            .expect("choose");
        assert!(!res.used_default);
    }

    #[test]
    fn stats_counts() {
        let r = Router::new();
        r.update(&config(
            0,
            vec![
                Cluster {
                    id: 0,
                    targets: vec![target(0, "a", 1)],
                },
                Cluster {
                    id: 5,
                    targets: vec![target(5, "b", 2), target(5, "c", 3)],
                },
            ],
        ));
        let stats = r.stats();
        assert_eq!(stats.clusters, 2);
        assert_eq!(stats.targets, 3);
        assert_eq!(stats.default_cluster_id, 0);
    }
}
