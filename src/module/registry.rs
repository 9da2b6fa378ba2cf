use std::collections::HashMap;
use std::sync::Arc;

use super::{Module, ModuleMap, ShellModule};
use crate::config::ModuleDef;
use crate::error::ConfigError;
use crate::state_machine::State;

/// Named modules, populated once at start-up and read-only afterwards.
#[derive(Default, Clone)]
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<dyn Module>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build shell modules from `[modules.<name>]` config tables.
    pub fn from_defs<'a>(
        defs: impl IntoIterator<Item = (&'a String, &'a ModuleDef)>,
    ) -> Self {
        let mut registry = Self::new();
        for (name, def) in defs {
            let mut module = ShellModule::new(name.clone(), def.command.clone());
            if let Some(output) = &def.output {
                module = module.with_output(output.clone());
            }
            registry = registry.with(name.clone(), Arc::new(module));
        }
        registry
    }

    pub fn with(mut self, name: impl Into<String>, module: Arc<dyn Module>) -> Self {
        let name = name.into();
        tracing::debug!(module = %name, "registered module");
        self.modules.insert(name, module);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.modules.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.modules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Turn `stage name -> module name` bindings into a [`ModuleMap`].
    pub fn resolve<'a>(
        &self,
        bindings: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> Result<ModuleMap, ConfigError> {
        let mut map = ModuleMap::new();
        for (stage, module) in bindings {
            let state = State::from_stage_name(stage)
                .ok_or_else(|| ConfigError::UnknownStage(stage.clone()))?;
            let module = self
                .get(module)
                .ok_or_else(|| ConfigError::UnknownModule(module.clone()))?;
            map.insert(state, module);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn registry() -> ModuleRegistry {
        let mut defs = BTreeMap::new();
        defs.insert(
            "prep".to_string(),
            ModuleDef {
                command: "mkdir -p {workDir}".into(),
                output: None,
            },
        );
        defs.insert(
            "submit".to_string(),
            ModuleDef {
                command: "qsub job.sh".into(),
                output: Some("batchID".into()),
            },
        );
        ModuleRegistry::from_defs(&defs)
    }

    #[test]
    fn resolves_stage_bindings() {
        let bindings: BTreeMap<String, String> = [
            ("preprocessing".to_string(), "prep".to_string()),
            ("submitting".to_string(), "submit".to_string()),
        ]
        .into();
        let map = registry().resolve(&bindings).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map[&State::Submitting].name(), "submit");
    }

    #[test]
    fn unknown_module_is_rejected() {
        let bindings: BTreeMap<String, String> =
            [("preprocessing".to_string(), "nope".to_string())].into();
        let Err(err) = registry().resolve(&bindings) else {
            panic!("unknown module resolved");
        };
        assert!(matches!(err, ConfigError::UnknownModule(name) if name == "nope"));
    }

    #[test]
    fn unknown_stage_is_rejected() {
        let bindings: BTreeMap<String, String> =
            [("running".to_string(), "prep".to_string())].into();
        let Err(err) = registry().resolve(&bindings) else {
            panic!("unknown stage resolved");
        };
        assert!(matches!(err, ConfigError::UnknownStage(name) if name == "running"));
    }

    #[test]
    fn names_are_sorted() {
        assert_eq!(registry().names(), vec!["prep", "submit"]);
    }
}
