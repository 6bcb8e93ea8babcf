use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::debug;
use crate::error::{FarrierError, Result};
use crate::formula::Formula;

/// Lookup capability handed to the resolver and the pipeline.
///
/// Anything that can map a formula name to a [`Formula`] works; there is no
/// global registry.
pub trait FormulaLookup {
    fn get(&self, name: &str) -> Option<&Formula>;
}

impl FormulaLookup for HashMap<String, Formula> {
    fn get(&self, name: &str) -> Option<&Formula> {
        HashMap::get(self, name)
    }
}

impl FormulaLookup for BTreeMap<String, Formula> {
    fn get(&self, name: &str) -> Option<&Formula> {
        BTreeMap::get(self, name)
    }
}

/// A set of formulas keyed by name, usually loaded from a formula directory.
#[derive(Debug, Default, Clone)]
pub struct Formulary {
    formulas: BTreeMap<String, Formula>,
}

impl Formulary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a formula, replacing any previous one with the same name.
    pub fn insert(&mut self, formula: Formula) {
        self.formulas.insert(formula.name.clone(), formula);
    }

    /// Loads every `*.toml` file in `dir`.
    ///
    /// A missing directory yields an empty formulary. One bad file fails the
    /// whole load so broken definitions are noticed early.
    ///
    /// # Errors
    ///
    /// Returns [`FarrierError::InvalidFormula`] for the first file that fails to parse.
    pub fn load_dir<P: AsRef<Path>>(dir: P) -> Result<Formulary> {
        let dir = dir.as_ref();
        let mut formulary = Formulary::new();
        if !dir.exists() {
            debug!("formula directory {} does not exist", dir.display());
            return Ok(formulary);
        }
        let entries = std::fs::read_dir(dir).map_err(|e| FarrierError::InvalidFormula {
            formula: String::new(),
            reason: format!("cannot read {}: {e}", dir.display()),
        })?;
        let mut paths: Vec<_> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        paths.sort();
        for path in paths {
            let formula = Formula::load(&path)?;
            debug!("loaded formula {} {} from {}", formula.name, formula.version, path.display());
            formulary.insert(formula);
        }
        debug!("{} formulas available from {}", formulary.len(), dir.display());
        Ok(formulary)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.formulas.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.formulas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formulas.is_empty()
    }
}

impl FormulaLookup for Formulary {
    fn get(&self, name: &str) -> Option<&Formula> {
        self.formulas.get(name)
    }
}

impl FromIterator<Formula> for Formulary {
    fn from_iter<I: IntoIterator<Item = Formula>>(iter: I) -> Self {
        let mut formulary = Formulary::new();
        for formula in iter {
            formulary.insert(formula);
        }
        formulary
    }
}
