use super::{parse_duration_string, Config};
use crate::error::{Error, Result};
use crate::supervisor::files::service_file_stem;

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.trim().is_empty() {
            return Err(Error::Validation("'data_dir' cannot be empty".to_string()));
        }

        // Duration strings must parse; intervals that drive loops must be non-zero
        let durations = [
            ("supervisor.heartbeat_interval", Some(&self.supervisor.heartbeat_interval), true),
            ("supervisor.settle_delay", Some(&self.supervisor.settle_delay), false),
            ("supervisor.stop_grace", Some(&self.supervisor.stop_grace), false),
            ("supervisor.stale_record_age", self.supervisor.stale_record_age.as_ref(), true),
            ("runtime.command_timeout", Some(&self.runtime.command_timeout), true),
            ("runtime.sync_interval", Some(&self.runtime.sync_interval), true),
        ];
        for (field, value, must_be_positive) in durations {
            let Some(value) = value else { continue };
            match parse_duration_string(value) {
                None => {
                    return Err(Error::Validation(format!(
                        "'{}' has invalid duration '{}'. Use formats like '500ms', '5s', '2m', '1h', '7d'",
                        field, value
                    )));
                }
                Some(d) if must_be_positive && d.is_zero() => {
                    return Err(Error::Validation(format!("'{}' must be greater than zero", field)));
                }
                Some(_) => {}
            }
        }

        for (name, recipe) in &self.services {
            service_file_stem(name).map_err(|e| {
                Error::Validation(format!("Service name '{}' is not usable: {}", name, e))
            })?;

            if recipe.program.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "Service '{}' has an empty 'program'",
                    name
                )));
            }

            if recipe.port == Some(0) {
                return Err(Error::Validation(format!(
                    "Service '{}' has port 0; omit 'port' instead",
                    name
                )));
            }
        }

        for tag in &self.host.tags {
            if tag.trim().is_empty() {
                return Err(Error::Validation("'host.tags' contains an empty tag".to_string()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceRecipe;
    use crate::state::ServiceType;
    use std::collections::BTreeMap;

    fn recipe(program: &str) -> ServiceRecipe {
        ServiceRecipe {
            service_type: ServiceType::Agent,
            program: program.to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            port: None,
            host: None,
        }
    }

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_empty_program() {
        let mut config = Config::default();
        config.services.insert("agent".into(), recipe("  "));
        assert!(matches!(config.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn rejects_path_unsafe_names() {
        for bad in ["../etc", ".hidden", "a/b", "", "api.v2", "api v2", "api:2"] {
            let mut config = Config::default();
            config.services.insert(bad.into(), recipe("sleep"));
            assert!(config.validate().is_err(), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn accepts_names_that_map_to_distinct_files() {
        let mut config = Config::default();
        for name in ["api_v2", "api-v2", "API2"] {
            config.services.insert(name.into(), recipe("sleep"));
        }
        config.validate().unwrap();
    }

    #[test]
    fn rejects_zero_heartbeat_and_bad_durations() {
        let mut config = Config::default();
        config.supervisor.heartbeat_interval = "0s".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.supervisor.stop_grace = "soon".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.runtime.sync_interval = "0s".into();
        assert!(config.validate().is_err());

        // A zero settle delay is allowed
        let mut config = Config::default();
        config.supervisor.settle_delay = "0ms".into();
        config.validate().unwrap();
    }
}
