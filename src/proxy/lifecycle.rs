//! Config lifecycle: initial load, SIGHUP reload, and the signal-to-action
//! mapping used by the runtime loop.

use std::sync::RwLock;

use crate::cli::Options;
use crate::config::{Manager, ManagerStats, Snapshot};
use crate::error::Result;
use crate::proxy::bootstrap::validate_bootstrap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Hup,
    Term,
    Int,
    Usr1,
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Hup => "SIGHUP",
            Signal::Term => "SIGTERM",
            Signal::Int => "SIGINT",
            Signal::Usr1 => "SIGUSR1",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Reload,
    Shutdown,
    LogRotate,
}

pub struct Lifecycle {
    manager: Manager,
    opts: Options,
    state: RwLock<Option<(Snapshot, Vec<String>)>>,
}

impl Lifecycle {
    pub fn new(manager: Manager, opts: Options) -> Self {
        Lifecycle {
            manager,
            opts,
            state: RwLock::new(None),
        }
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    pub fn load_initial(&self) -> Result<(Snapshot, Vec<String>)> {
        self.reload()
    }

    /// Reload and validate. On success the snapshot becomes current; on
    /// failure the previous snapshot stays in effect.
    pub fn reload(&self) -> Result<(Snapshot, Vec<String>)> {
        let snapshot = self.manager.reload()?;
        let bootstrap = validate_bootstrap(&self.opts, &snapshot.config)?;

        *self.state.write().expect("lifecycle lock") =
            Some((snapshot.clone(), bootstrap.warnings.clone()));
        Ok((snapshot, bootstrap.warnings))
    }

    pub fn current(&self) -> Option<(Snapshot, Vec<String>)> {
        self.state.read().expect("lifecycle lock").clone()
    }

    pub fn manager_stats(&self) -> ManagerStats {
        self.manager.stats()
    }

    pub fn action_for(&self, sig: Signal) -> SignalAction {
        match sig {
            Signal::Hup => SignalAction::Reload,
            Signal::Term | Signal::Int => SignalAction::Shutdown,
            Signal::Usr1 => SignalAction::LogRotate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lifecycle_with(content: &str) -> (tempfile::TempDir, Lifecycle) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("backend.conf");
        std::fs::write(&path, content).expect("write config");
        let lc = Lifecycle::new(Manager::new(&path), Options::default());
        (dir, lc)
    }

    #[test]
    fn initial_load_installs_snapshot() {
        let (_dir, lc) = lifecycle_with("proxy 10.0.0.1:443;\n");
        let (snapshot, warnings) = lc.load_initial().expect("load");
        assert_eq!(snapshot.config.targets.len(), 1);
        assert!(warnings.is_empty());
        assert!(lc.current().is_some());
    }

    #[test]
    fn failed_reload_keeps_current() {
        let (dir, lc) = lifecycle_with("proxy 10.0.0.1:443;\n");
        lc.load_initial().expect("load");

        std::fs::write(dir.path().join("backend.conf"), "garbage").expect("break config");
        assert!(lc.reload().is_err());

        let (snapshot, _) = lc.current().expect("still current");
        assert_eq!(snapshot.config.targets[0].port, 443);
    }

    #[test]
    fn signal_actions() {
        let (_dir, lc) = lifecycle_with("proxy 10.0.0.1:443;\n");
        assert_eq!(lc.action_for(Signal::Hup), SignalAction::Reload);
        assert_eq!(lc.action_for(Signal::Term), SignalAction::Shutdown);
        assert_eq!(lc.action_for(Signal::Int), SignalAction::Shutdown);
        assert_eq!(lc.action_for(Signal::Usr1), SignalAction::LogRotate);
    }
}
