//! Configuration parsing and types.
//!
//! - `types` - root `Config` and the supervisor/runtime/host settings
//! - `recipe` - per-service launch recipes and the resolved `CommandSpec`
//! - `duration` - human-readable duration strings
//! - `parser` - locating and parsing `fleet.yaml`
//! - `validation` - `Config::validate`

mod duration;
mod parser;
mod recipe;
mod types;
mod validation;

pub use duration::*;
pub use parser::*;
pub use recipe::*;
pub use types::*;

use std::collections::BTreeMap;
use std::path::Path;

impl Config {
    /// Resolve every configured recipe into a [`CommandSpec`].
    pub fn command_specs(&self, base_dir: &Path) -> BTreeMap<String, CommandSpec> {
        self.services
            .iter()
            .map(|(name, recipe)| (name.clone(), recipe.to_command_spec(base_dir)))
            .collect()
    }
}
