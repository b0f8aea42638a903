//! Backend registry.
//!
//! Backends are looked up by their exact (upper-case) name:
//!
//! | name        | backend                            |
//! |-------------|------------------------------------|
//! | `PYSTAN`    | `HttpStanBackend` (httpstan REST)  |
//! | `CMDSTANPY` | `CmdStanBackend` (CmdStan binary)  |

use std::fmt;
use std::str::FromStr;

use crate::config::BackendConfig;
use crate::error::BackendError;
use crate::models::backend::StanBackend;
use crate::models::cmdstan::CmdStanBackend;
use crate::models::httpstan::HttpStanBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanBackendKind {
    PyStan,
    CmdStanPy,
}

/// Constructs a ready-to-use backend.
pub type BackendFactory = fn(&BackendConfig) -> Result<Box<dyn StanBackend>, BackendError>;

static BACKENDS: [(&str, StanBackendKind); 2] = [
    ("PYSTAN", StanBackendKind::PyStan),
    ("CMDSTANPY", StanBackendKind::CmdStanPy),
];

fn build_httpstan(config: &BackendConfig) -> Result<Box<dyn StanBackend>, BackendError> {
    Ok(Box::new(HttpStanBackend::new(config)?))
}

fn build_cmdstan(config: &BackendConfig) -> Result<Box<dyn StanBackend>, BackendError> {
    Ok(Box::new(CmdStanBackend::new(config)?))
}

impl StanBackendKind {
    pub const ALL: [StanBackendKind; 2] = [StanBackendKind::PyStan, StanBackendKind::CmdStanPy];

    pub fn name(self) -> &'static str {
        match self {
            StanBackendKind::PyStan => "PYSTAN",
            StanBackendKind::CmdStanPy => "CMDSTANPY",
        }
    }

    pub fn factory(self) -> BackendFactory {
        match self {
            StanBackendKind::PyStan => build_httpstan,
            StanBackendKind::CmdStanPy => build_cmdstan,
        }
    }

    /// Construct the backend (this loads its model).
    pub fn build(self, config: &BackendConfig) -> Result<Box<dyn StanBackend>, BackendError> {
        (self.factory())(config)
    }
}

impl fmt::Display for StanBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StanBackendKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        get_backend_class(s)
    }
}

/// Resolve a backend name. Names are case-sensitive.
pub fn get_backend_class(name: &str) -> Result<StanBackendKind, BackendError> {
    BACKENDS
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, kind)| *kind)
        .ok_or_else(|| BackendError::UnknownBackend(name.to_string()))
}

/// Registered backend names, in registry order.
pub fn backend_names() -> Vec<&'static str> {
    BACKENDS.iter().map(|(name, _)| *name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_registered_names() {
        assert_eq!(get_backend_class("PYSTAN").unwrap(), StanBackendKind::PyStan);
        assert_eq!(get_backend_class("CMDSTANPY").unwrap(), StanBackendKind::CmdStanPy);
        assert_eq!("CMDSTANPY".parse::<StanBackendKind>().unwrap(), StanBackendKind::CmdStanPy);
        assert_eq!(backend_names(), ["PYSTAN", "CMDSTANPY"]);
    }

    #[test]
    fn lookup_is_case_sensitive() {
        for name in ["cmdstanpy", "PyStan", "", "STAN"] {
            let err = get_backend_class(name).unwrap_err();
            assert!(matches!(&err, BackendError::UnknownBackend(n) if n == name));
            assert_eq!(err.to_string(), format!("Unknown stan backend: {name}"));
        }
    }

    #[test]
    fn names_round_trip_through_kind() {
        for kind in StanBackendKind::ALL {
            assert_eq!(get_backend_class(kind.name()).unwrap(), kind);
            assert_eq!(kind.to_string(), kind.name());
        }
    }

    #[test]
    fn build_propagates_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let config = BackendConfig {
            model_dir: dir.path().to_path_buf(),
            resource_dir: dir.path().to_path_buf(),
            httpstan_url: "http://127.0.0.1:1".into(),
            auto_download: false,
        };
        for kind in StanBackendKind::ALL {
            assert!(matches!(kind.build(&config), Err(BackendError::Load(_))));
        }
    }

    #[test]
    fn backends_report_their_kind() {
        assert_eq!(CmdStanBackend::KIND, StanBackendKind::CmdStanPy);
        assert_eq!(HttpStanBackend::KIND, StanBackendKind::PyStan);
    }
}
