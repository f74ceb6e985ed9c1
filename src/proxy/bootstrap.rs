//! Startup validation of options against the parsed config.

use crate::cli::Options;
use crate::config::Config;
use crate::error::{ProxyError, Result};

#[derive(Debug, Clone, Default)]
pub struct BootstrapResult {
    pub warnings: Vec<String>,
}

pub fn validate_bootstrap(opts: &Options, cfg: &Config) -> Result<BootstrapResult> {
    let mut res = BootstrapResult::default();

    if !cfg.have_proxy {
        return Err(ProxyError::ConfigParse(
            "no MTProto next proxy servers defined to forward queries to".into(),
        ));
    }

    if !opts.domains.is_empty() {
        if opts.workers > 0 {
            res.warnings
                .push("It is recommended to not use workers with TLS-transport".into());
        }
        if opts.secrets.is_empty() {
            return Err(ProxyError::ConfigParse(
                "You must specify at least one mtproto-secret to use when using TLS-transport".into(),
            ));
        }
    }

    Ok(res)
}
