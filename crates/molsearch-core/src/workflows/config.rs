use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),
    #[error("Unknown optimization algorithm '{0}'")]
    UnknownAlgorithm(String),
    #[error("Invalid value for '{name}': {reason}")]
    InvalidValue { name: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("File I/O error for '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("TOML parsing error for '{path}': {source}")]
    Toml {
        path: String,
        source: toml::de::Error,
    },
    #[error("Invalid configuration in '{path}': {source}")]
    Invalid { path: String, source: ConfigError },
}

/// The search strategy driving a hyperparameter optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum SearchAlgorithm {
    /// Bounded Nelder-Mead simplex minimization.
    NelderMead,
    /// Bounded steepest descent on finite-difference gradients.
    ProjectedGradient,
    /// Coordinate-descent sweep over discretized ranges.
    Grid,
    /// Tree-structured Parzen estimator.
    Tpe,
}

impl FromStr for SearchAlgorithm {
    type Err = ConfigError;

    /// Accepts the common SciPy method names: derivative-free ones map to Nelder-Mead, the
    /// gradient-based ones to projected gradient descent.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" | "nelder-mead" | "neldermead" | "powell" | "cobyla" => {
                Ok(SearchAlgorithm::NelderMead)
            }
            "gradient" | "projected-gradient" | "l-bfgs-b" | "bfgs" | "cg" | "tnc" | "slsqp"
            | "trust-constr" => Ok(SearchAlgorithm::ProjectedGradient),
            "grid" | "brute" => Ok(SearchAlgorithm::Grid),
            "tpe" => Ok(SearchAlgorithm::Tpe),
            _ => Err(ConfigError::UnknownAlgorithm(s.to_string())),
        }
    }
}

impl TryFrom<String> for SearchAlgorithm {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LocalSearchConfig {
    /// Simplex size below which the search stops.
    pub xatol: f64,
    /// Loss spread across the simplex below which the search stops.
    pub fatol: f64,
}

impl Default for LocalSearchConfig {
    fn default() -> Self {
        Self {
            xatol: 1e-8,
            fatol: 1e-4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GridSearchConfig {
    /// Number of candidates per hyperparameter.
    pub grid_size: usize,
}

impl Default for GridSearchConfig {
    fn default() -> Self {
        Self { grid_size: 9 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TpeConfig {
    /// Trials sampled uniformly before the density model is used.
    pub startup_trials: usize,
    /// Candidates drawn from the good-trial density per suggestion.
    pub candidates: usize,
    /// Fraction (scaled by the square root of the trial count) of trials considered good.
    pub gamma: f64,
    pub seed: Option<u64>,
}

impl Default for TpeConfig {
    fn default() -> Self {
        Self {
            startup_trials: 20,
            candidates: 24,
            gamma: 0.25,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HyperparameterOptimizationConfig {
    /// Names of the hyperparameters to search, in search-vector order.
    pub hyperparameters: Vec<String>,
    pub algorithm: SearchAlgorithm,
    #[serde(default = "default_maximum_evaluations")]
    pub maximum_evaluations: usize,
    #[serde(default)]
    pub local: LocalSearchConfig,
    #[serde(default)]
    pub grid: GridSearchConfig,
    #[serde(default)]
    pub tpe: TpeConfig,
    /// Also compute the loss of every cross-validation split.
    #[serde(default)]
    pub calculate_split_errors: bool,
}

fn default_maximum_evaluations() -> usize {
    10_000
}

impl HyperparameterOptimizationConfig {
    pub fn from_toml_path(path: &Path) -> Result<Self, ConfigLoadError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigLoadError::Io {
            path: path.to_string_lossy().to_string(),
            source: e,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigLoadError::Toml {
            path: path.to_string_lossy().to_string(),
            source: e,
        })?;
        config.validate().map_err(|e| ConfigLoadError::Invalid {
            path: path.to_string_lossy().to_string(),
            source: e,
        })?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hyperparameters.is_empty() {
            return Err(ConfigError::MissingParameter("hyperparameters"));
        }
        if self.maximum_evaluations == 0 {
            return Err(ConfigError::InvalidValue {
                name: "maximum_evaluations",
                reason: "must be at least 1".into(),
            });
        }
        if self.grid.grid_size == 0 {
            return Err(ConfigError::InvalidValue {
                name: "grid_size",
                reason: "must be at least 1".into(),
            });
        }
        if !(self.tpe.gamma > 0.0 && self.tpe.gamma <= 1.0) {
            return Err(ConfigError::InvalidValue {
                name: "gamma",
                reason: format!("{} is outside (0, 1]", self.tpe.gamma),
            });
        }
        if self.tpe.candidates == 0 {
            return Err(ConfigError::InvalidValue {
                name: "candidates",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct HyperparameterOptimizationConfigBuilder {
    hyperparameters: Vec<String>,
    algorithm: Option<SearchAlgorithm>,
    maximum_evaluations: Option<usize>,
    local: LocalSearchConfig,
    grid: GridSearchConfig,
    tpe: TpeConfig,
    calculate_split_errors: bool,
}

impl HyperparameterOptimizationConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hyperparameter(mut self, name: &str) -> Self {
        self.hyperparameters.push(name.to_string());
        self
    }
    pub fn hyperparameters<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hyperparameters.extend(names.into_iter().map(Into::into));
        self
    }
    pub fn algorithm(mut self, algorithm: SearchAlgorithm) -> Self {
        self.algorithm = Some(algorithm);
        self
    }
    pub fn maximum_evaluations(mut self, n: usize) -> Self {
        self.maximum_evaluations = Some(n);
        self
    }
    pub fn tolerances(mut self, xatol: f64, fatol: f64) -> Self {
        self.local = LocalSearchConfig { xatol, fatol };
        self
    }
    pub fn grid_size(mut self, size: usize) -> Self {
        self.grid.grid_size = size;
        self
    }
    pub fn tpe_startup_trials(mut self, n: usize) -> Self {
        self.tpe.startup_trials = n;
        self
    }
    pub fn tpe_candidates(mut self, n: usize) -> Self {
        self.tpe.candidates = n;
        self
    }
    pub fn tpe_gamma(mut self, gamma: f64) -> Self {
        self.tpe.gamma = gamma;
        self
    }
    pub fn seed(mut self, seed: u64) -> Self {
        self.tpe.seed = Some(seed);
        self
    }
    pub fn calculate_split_errors(mut self, on: bool) -> Self {
        self.calculate_split_errors = on;
        self
    }

    pub fn build(self) -> Result<HyperparameterOptimizationConfig, ConfigError> {
        let config = HyperparameterOptimizationConfig {
            hyperparameters: self.hyperparameters,
            algorithm: self
                .algorithm
                .ok_or(ConfigError::MissingParameter("algorithm"))?,
            maximum_evaluations: self
                .maximum_evaluations
                .unwrap_or_else(default_maximum_evaluations),
            local: self.local,
            grid: self.grid,
            tpe: self.tpe,
            calculate_split_errors: self.calculate_split_errors,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn algorithm_names_are_case_insensitive_with_aliases() {
        assert_eq!("Nelder-Mead".parse(), Ok(SearchAlgorithm::NelderMead));
        assert_eq!("local".parse(), Ok(SearchAlgorithm::NelderMead));
        assert_eq!("BRUTE".parse(), Ok(SearchAlgorithm::Grid));
        assert_eq!("tpe".parse(), Ok(SearchAlgorithm::Tpe));
        assert_eq!("Powell".parse(), Ok(SearchAlgorithm::NelderMead));
        for name in ["L-BFGS-B", "bfgs", "CG", "TNC", "SLSQP", "trust-constr", "gradient"] {
            assert_eq!(name.parse(), Ok(SearchAlgorithm::ProjectedGradient), "{name}");
        }
        assert_eq!(
            "annealing".parse::<SearchAlgorithm>(),
            Err(ConfigError::UnknownAlgorithm("annealing".into()))
        );
    }

    #[test]
    fn builder_applies_defaults() {
        let config = HyperparameterOptimizationConfigBuilder::new()
            .hyperparameters(["sigma", "lambda"])
            .algorithm(SearchAlgorithm::Grid)
            .build()
            .unwrap();
        assert_eq!(config.hyperparameters, vec!["sigma", "lambda"]);
        assert_eq!(config.grid.grid_size, 9);
        assert_eq!(config.maximum_evaluations, 10_000);
        assert!(!config.calculate_split_errors);
    }

    #[test]
    fn builder_fails_if_required_parameter_is_missing() {
        let result = HyperparameterOptimizationConfigBuilder::new()
            .algorithm(SearchAlgorithm::Tpe)
            .build();
        assert_eq!(result, Err(ConfigError::MissingParameter("hyperparameters")));

        let result = HyperparameterOptimizationConfigBuilder::new()
            .hyperparameter("sigma")
            .build();
        assert_eq!(result, Err(ConfigError::MissingParameter("algorithm")));
    }

    #[test]
    fn builder_rejects_empty_grid() {
        let result = HyperparameterOptimizationConfigBuilder::new()
            .hyperparameter("sigma")
            .algorithm(SearchAlgorithm::Grid)
            .grid_size(0)
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidValue { name: "grid_size", .. })));
    }

    #[test]
    fn loads_from_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("search.toml");
        fs::write(
            &path,
            r#"
hyperparameters = ["sigma", "lambda"]
algorithm = "TPE"
maximum_evaluations = 50

[tpe]
startup_trials = 5
seed = 7
"#,
        )
        .unwrap();
        let config = HyperparameterOptimizationConfig::from_toml_path(&path).unwrap();
        assert_eq!(config.algorithm, SearchAlgorithm::Tpe);
        assert_eq!(config.maximum_evaluations, 50);
        assert_eq!(config.tpe.startup_trials, 5);
        assert_eq!(config.tpe.candidates, 24);
        assert_eq!(config.tpe.seed, Some(7));
    }

    #[test]
    fn toml_loading_reports_each_failure_kind() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            HyperparameterOptimizationConfig::from_toml_path(&missing),
            Err(ConfigLoadError::Io { .. })
        ));

        let unknown = dir.path().join("unknown.toml");
        fs::write(&unknown, "hyperparameters = [\"sigma\"]\nalgorithm = \"simplex\"\n").unwrap();
        assert!(matches!(
            HyperparameterOptimizationConfig::from_toml_path(&unknown),
            Err(ConfigLoadError::Toml { .. })
        ));

        let empty = dir.path().join("empty.toml");
        fs::write(&empty, "hyperparameters = []\nalgorithm = \"grid\"\n").unwrap();
        assert!(matches!(
            HyperparameterOptimizationConfig::from_toml_path(&empty),
            Err(ConfigLoadError::Invalid { .. })
        ));
    }
}
