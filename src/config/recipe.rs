//! Launch recipes and the typed command spec handed to the supervisor.

use crate::state::ServiceType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// How a service is launched, as written in `fleet.yaml`.
///
/// ```yaml
/// services:
///   infra-api:
///     type: infra-api
///     program: ./bin/infra-api
///     args: ["--listen", "{host}:{port}"]
///     port: 8400
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecipe {
    #[serde(rename = "type")]
    pub service_type: ServiceType,

    pub program: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Working directory, relative to the config file directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

/// Fully resolved launch instruction for one service.
///
/// Serialized into the registry's config snapshot so `restart` can relaunch
/// exactly what was last started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub service_type: ServiceType,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub host: Option<String>,
}

impl CommandSpec {
    pub fn new(service_type: ServiceType, program: impl Into<String>) -> Self {
        Self {
            service_type,
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            port: None,
            host: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// One-line rendering for logs.
    pub fn display_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl ServiceRecipe {
    /// Resolve into a [`CommandSpec`]: substitutes `{port}` and `{host}` in
    /// args and env values and anchors a relative `cwd` at `base_dir`.
    pub fn to_command_spec(&self, base_dir: &Path) -> CommandSpec {
        let substitute = |s: &str| -> String {
            let mut out = s.to_string();
            if let Some(port) = self.port {
                out = out.replace("{port}", &port.to_string());
            }
            if let Some(ref host) = self.host {
                out = out.replace("{host}", host);
            }
            out
        };

        CommandSpec {
            service_type: self.service_type,
            program: self.program.clone(),
            args: self.args.iter().map(|a| substitute(a)).collect(),
            env: self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), substitute(v)))
                .collect(),
            cwd: self.cwd.as_ref().map(|c| {
                let path = Path::new(c);
                if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    base_dir.join(path)
                }
            }),
            port: self.port,
            host: self.host.clone(),
        }
    }
}
