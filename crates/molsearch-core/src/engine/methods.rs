use nalgebra::{DMatrix, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use tracing::{debug, info, trace};

use super::ani::AniMethod;
use super::error::ModelError;
use super::model::{Model, PredictionRequest, PredictionTargets};
use super::record::ModelRecord;
use crate::core::models::molecule::Molecule;

/// Default MNDO location used when neither semi-empirical program is configured.
pub const DEFAULT_MNDO_LOCATION: &str = "~/apps/mndo2020/mndo2020";

/// External programs a [`Method`] can dispatch to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Program {
    Aiqm1,
    Ani,
    Mndo,
    Sparrow,
    Xtb,
    Dftd4,
    CcsdtStarCbs,
    Gaussian,
    Pyscf,
}

impl Program {
    /// All programs in resolution order.
    pub const ALL: [Program; 9] = [
        Program::Aiqm1,
        Program::Ani,
        Program::Mndo,
        Program::Sparrow,
        Program::Xtb,
        Program::Dftd4,
        Program::CcsdtStarCbs,
        Program::Gaussian,
        Program::Pyscf,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Program::Aiqm1 => "aiqm1",
            Program::Ani => "ani",
            Program::Mndo => "mndo",
            Program::Sparrow => "sparrow",
            Program::Xtb => "xtb",
            Program::Dftd4 => "dftd4",
            Program::CcsdtStarCbs => "ccsdtstarcbs",
            Program::Gaussian => "gaussian",
            Program::Pyscf => "pyscf",
        }
    }

    /// Methods registered for this program. Gaussian and PySCF accept any method string.
    pub fn methods(self) -> &'static [&'static str] {
        match self {
            Program::Aiqm1 => &["AIQM1", "AIQM1@DFT", "AIQM1@DFT*"],
            Program::Ani => &["ANI-1x", "ANI-1ccx", "ANI-2x", "ANI-1x-D4", "ANI-2x-D4"],
            Program::Mndo => &[
                "ODM2*", "ODM2", "ODM3", "OM3", "OM2", "OM1", "PM3", "AM1", "MNDO/d", "MNDOC",
                "MNDO", "MINDO/3", "CNDO/2", "SCC-DFTB", "SCC-DFTB-heats", "MNDO/H", "MNDO/dH",
            ],
            Program::Sparrow => &[
                "DFTB0", "DFTB2", "DFTB3", "MNDO", "MNDO/d", "AM1", "RM1", "PM3", "PM6", "OM2",
                "OM3", "ODM2*", "ODM3*", "AIQM1",
            ],
            Program::Xtb => &["GFN2-xTB"],
            Program::Dftd4 => &["D4"],
            Program::CcsdtStarCbs => &["CCSD(T)*/CBS"],
            Program::Gaussian | Program::Pyscf => &[],
        }
    }

    /// The environment variable that points at this program's executable (or, for ANI, at
    /// the directory of pretrained ensembles).
    pub fn location_variable(self) -> &'static str {
        match self {
            Program::Aiqm1 | Program::Mndo => "mndobin",
            Program::Ani => "anidir",
            Program::Sparrow => "sparrowbin",
            Program::Xtb => "xtbbin",
            Program::Dftd4 => "dftd4bin",
            Program::CcsdtStarCbs => "orcabin",
            Program::Gaussian => "gaussianbin",
            Program::Pyscf => "pyscfbin",
        }
    }

    pub fn default_location(self) -> Option<&'static str> {
        match self {
            Program::Mndo => Some(DEFAULT_MNDO_LOCATION),
            _ => None,
        }
    }

    pub fn supports(self, method: &str) -> bool {
        self.methods().iter().any(|m| m.eq_ignore_ascii_case(method))
    }

    fn accepts(self, method: &str) -> bool {
        self.methods().is_empty() || self.supports(method)
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Program {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Program::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| ModelError::Configuration(format!("unknown program '{s}'")))
    }
}

/// Every method name known to the registry.
pub fn known_methods() -> BTreeSet<&'static str> {
    Program::ALL
        .into_iter()
        .flat_map(|p| p.methods().iter().copied())
        .collect()
}

/// Case-insensitive registry lookup.
pub fn is_known_method(method: &str) -> bool {
    known_methods()
        .iter()
        .any(|m| m.eq_ignore_ascii_case(method))
}

/// Looks up program locations in an environment.
pub trait ProgramLocator: Send + Sync {
    fn variable(&self, name: &str) -> Option<String>;

    fn exists(&self, path: &Path) -> bool;
}

/// Resolves locations from the process environment and the filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvironmentLocator;

impl ProgramLocator for EnvironmentLocator {
    fn variable(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// A fixed environment, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct MapLocator {
    variables: HashMap<String, String>,
    existing: HashSet<PathBuf>,
}

impl MapLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_variable(mut self, name: &str, value: &str) -> Self {
        self.variables.insert(name.to_string(), value.to_string());
        self
    }

    /// Declares `path` as present, and sets `variable` to it.
    pub fn with_program(self, variable: &str, path: &str) -> Self {
        self.with_path(path).with_variable(variable, path)
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.existing.insert(PathBuf::from(path));
        self
    }
}

impl ProgramLocator for MapLocator {
    fn variable(&self, name: &str) -> Option<String> {
        self.variables.get(name).cloned()
    }

    fn exists(&self, path: &Path) -> bool {
        self.existing.contains(path)
    }
}

/// The program chosen for a method, with its located executable or data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub program: Program,
    pub location: PathBuf,
}

fn expand_home(path: &str, locator: &dyn ProgramLocator) -> PathBuf {
    match (path.strip_prefix("~/"), locator.variable("HOME")) {
        (Some(rest), Some(home)) => Path::new(&home).join(rest),
        _ => PathBuf::from(path),
    }
}

fn locate(program: Program, locator: &dyn ProgramLocator) -> Result<PathBuf, ModelError> {
    let variable = program.location_variable();
    let raw = locator
        .variable(variable)
        .or_else(|| program.default_location().map(str::to_string))
        .ok_or_else(|| {
            ModelError::Configuration(format!(
                "cannot find {program}, please set the environment variable: export {variable}=..."
            ))
        })?;
    let path = expand_home(&raw, locator);
    if !locator.exists(&path) {
        return Err(ModelError::Configuration(format!(
            "{program} location {} does not exist (set {variable})",
            path.display()
        )));
    }
    Ok(path)
}

/// Picks the program implementing `method`.
///
/// Methods offered by both semi-empirical programs go to MNDO when `mndobin` is set, then to
/// Sparrow when `sparrowbin` is set, and finally to MNDO at its default location. Sparrow
/// methods without a configured Sparrow are looked up in the remaining registry, so `AIQM1`
/// resolves to its own interface.
pub fn resolve(
    method: &str,
    program: Option<Program>,
    locator: &dyn ProgramLocator,
) -> Result<Resolution, ModelError> {
    if let Some(program) = program {
        if !program.accepts(method) {
            return Err(ModelError::Configuration(format!(
                "program {program} does not implement method '{method}'"
            )));
        }
        let location = locate(program, locator)?;
        return Ok(Resolution { program, location });
    }

    let in_mndo = Program::Mndo.supports(method);
    let in_sparrow = Program::Sparrow.supports(method);
    let shared = if in_mndo && locator.variable("mndobin").is_some() {
        Some(Program::Mndo)
    } else if in_sparrow && locator.variable("sparrowbin").is_some() {
        Some(Program::Sparrow)
    } else if in_mndo {
        Some(Program::Mndo)
    } else {
        None
    };
    if let Some(program) = shared {
        let location = locate(program, locator)?;
        return Ok(Resolution { program, location });
    }

    let program = Program::ALL
        .into_iter()
        .find(|p| p.supports(method))
        .ok_or_else(|| {
            ModelError::Configuration(format!(
                "can't find appropriate interface for the requested method '{method}'"
            ))
        })?;
    let location = locate(program, locator)?;
    Ok(Resolution { program, location })
}

/// One single-point calculation handed to an external program.
#[derive(Debug, Clone, Serialize)]
pub struct ProgramJob<'a> {
    pub program: Program,
    pub method: &'a str,
    pub kwargs: &'a BTreeMap<String, serde_json::Value>,
    pub charge: i32,
    pub multiplicity: u32,
    pub atomic_numbers: Vec<u8>,
    pub coordinates: Vec<[f64; 3]>,
    pub calculate_energy: bool,
    pub calculate_energy_gradients: bool,
    pub calculate_hessian: bool,
}

/// What an external program reports back. Missing fields mean "not computed".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgramOutput {
    #[serde(default)]
    pub energy: Option<f64>,
    #[serde(default)]
    pub energy_gradients: Option<Vec<[f64; 3]>>,
    #[serde(default)]
    pub hessian: Option<Vec<Vec<f64>>>,
}

/// The invocation boundary to a deterministic external calculator.
pub trait ExternalProgram: Send {
    fn run(&mut self, job: &ProgramJob<'_>) -> Result<ProgramOutput, ModelError>;

    fn set_num_threads(&mut self, _nthreads: usize) {}
}

/// Runs a located executable, writing the job as JSON to its stdin and reading a
/// [`ProgramOutput`] JSON document from its stdout.
#[derive(Debug, Clone)]
pub struct CommandProgram {
    executable: PathBuf,
    nthreads: Option<usize>,
}

impl CommandProgram {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            nthreads: None,
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }
}

impl ExternalProgram for CommandProgram {
    fn run(&mut self, job: &ProgramJob<'_>) -> Result<ProgramOutput, ModelError> {
        let failure = || ModelError::BackendFailure {
            method: job.method.to_string(),
            property: "output".into(),
        };
        let input = serde_json::to_vec(job).map_err(|_| failure())?;

        let mut command = Command::new(&self.executable);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(n) = self.nthreads {
            command.env("OMP_NUM_THREADS", n.to_string());
        }
        trace!(executable = %self.executable.display(), method = job.method, "Spawning external program");
        let mut child = command
            .spawn()
            .map_err(|e| ModelError::io(&self.executable, e))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&input)
                .map_err(|e| ModelError::io(&self.executable, e))?;
        }
        let output = child
            .wait_with_output()
            .map_err(|e| ModelError::io(&self.executable, e))?;
        if !output.status.success() {
            debug!(
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "External program failed"
            );
            return Err(failure());
        }
        serde_json::from_slice(&output.stdout).map_err(|_| failure())
    }

    fn set_num_threads(&mut self, nthreads: usize) {
        self.nthreads = Some(nthreads);
    }
}

enum Backend {
    External(Box<dyn ExternalProgram>),
    Ani(Box<AniMethod>),
}

/// A deterministic model backed by an external program selected by method name.
pub struct Method {
    method: String,
    program: Program,
    explicit_program: bool,
    kwargs: BTreeMap<String, serde_json::Value>,
    backend: Backend,
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("method", &self.method)
            .field("program", &self.program)
            .field("kwargs", &self.kwargs)
            .finish()
    }
}

impl Method {
    /// Resolves `method` against the process environment.
    pub fn new(method: &str) -> Result<Self, ModelError> {
        Self::resolve(method, None, BTreeMap::new(), &EnvironmentLocator)
    }

    pub fn resolve(
        method: &str,
        program: Option<&str>,
        kwargs: BTreeMap<String, serde_json::Value>,
        locator: &dyn ProgramLocator,
    ) -> Result<Self, ModelError> {
        let requested = program.map(Program::from_str).transpose()?;
        let Resolution { program, location } = resolve(method, requested, locator)?;
        info!(method, %program, location = %location.display(), "Resolved method");
        let backend = match program {
            Program::Ani => Backend::Ani(Box::new(AniMethod::load(method, &location, locator)?)),
            _ => Backend::External(Box::new(CommandProgram::new(location))),
        };
        Ok(Self {
            method: method.to_string(),
            program,
            explicit_program: requested.is_some(),
            kwargs,
            backend,
        })
    }

    /// Wraps an already constructed backend, bypassing resolution.
    pub fn with_backend(
        method: &str,
        program: Program,
        kwargs: BTreeMap<String, serde_json::Value>,
        backend: Box<dyn ExternalProgram>,
    ) -> Self {
        Self {
            method: method.to_string(),
            program,
            explicit_program: true,
            kwargs,
            backend: Backend::External(backend),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn program(&self) -> Program {
        self.program
    }

    pub fn kwargs(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.kwargs
    }
}

fn run_external(
    backend: &mut dyn ExternalProgram,
    program: Program,
    method: &str,
    kwargs: &BTreeMap<String, serde_json::Value>,
    molecule: &mut Molecule,
    targets: &PredictionTargets,
) -> Result<(), ModelError> {
    let job = ProgramJob {
        program,
        method,
        kwargs,
        charge: molecule.charge,
        multiplicity: molecule.multiplicity,
        atomic_numbers: molecule.atomic_numbers(),
        coordinates: molecule
            .positions()
            .iter()
            .map(|p| [p.x, p.y, p.z])
            .collect(),
        calculate_energy: targets.property.is_some(),
        calculate_energy_gradients: targets.xyz_derivative_property.is_some(),
        calculate_hessian: targets.hessian.is_some(),
    };
    let output = backend.run(&job)?;
    let missing = |property: &str| ModelError::BackendFailure {
        method: method.to_string(),
        property: property.to_string(),
    };

    if let Some(name) = &targets.property {
        let energy = output
            .energy
            .filter(|e| e.is_finite())
            .ok_or_else(|| missing(name))?;
        molecule.set_scalar(name, energy);
    }
    if let Some(name) = &targets.xyz_derivative_property {
        let gradients = output
            .energy_gradients
            .as_ref()
            .filter(|g| g.len() == molecule.atom_count())
            .ok_or_else(|| missing(name))?;
        molecule.set_atom_vectors(
            name,
            gradients.iter().map(|g| Vector3::new(g[0], g[1], g[2])).collect(),
        );
    }
    if let Some(name) = &targets.hessian {
        let dim = 3 * molecule.atom_count();
        let rows = output
            .hessian
            .as_ref()
            .filter(|h| h.len() == dim && h.iter().all(|r| r.len() == dim))
            .ok_or_else(|| missing(name))?;
        molecule.set_tensor(name, DMatrix::from_fn(dim, dim, |i, j| rows[i][j]));
    }
    Ok(())
}

impl Model for Method {
    fn kind(&self) -> &'static str {
        "method"
    }

    fn predict_batch(
        &mut self,
        molecules: &mut [Molecule],
        request: &PredictionRequest,
    ) -> Result<(), ModelError> {
        let mut targets = request.targets();
        if targets.is_empty() {
            targets = PredictionRequest::energy().targets();
        }
        let Self {
            method,
            program,
            kwargs,
            backend,
            ..
        } = self;
        match backend {
            Backend::Ani(ani) => ani.predict_batch(molecules, request),
            Backend::External(external) => molecules.iter_mut().try_for_each(|m| {
                run_external(external.as_mut(), *program, method, kwargs, m, &targets)
            }),
        }
    }

    fn set_num_threads(&mut self, nthreads: usize) {
        match &mut self.backend {
            Backend::External(backend) => backend.set_num_threads(nthreads),
            Backend::Ani(ani) => ani.set_num_threads(nthreads),
        }
    }

    fn config_multiprocessing(&mut self) {
        if let Backend::Ani(ani) = &mut self.backend {
            ani.config_multiprocessing();
        }
    }

    fn to_record(&self) -> Result<ModelRecord, ModelError> {
        Ok(ModelRecord::Method {
            method: self.method.clone(),
            program: self.explicit_program.then(|| self.program.name().to_string()),
            kwargs: self.kwargs.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::molecule::{ENERGY, ENERGY_GRADIENTS};

    struct Fixed(ProgramOutput);

    impl ExternalProgram for Fixed {
        fn run(&mut self, _job: &ProgramJob<'_>) -> Result<ProgramOutput, ModelError> {
            Ok(self.0.clone())
        }
    }

    fn water() -> Molecule {
        Molecule::from_numbers_and_coordinates(&[
            (8, [0.0, 0.0, 0.0]),
            (1, [0.0, 0.76, 0.59]),
            (1, [0.0, -0.76, 0.59]),
        ])
    }

    #[test]
    fn registry_lookup_is_case_insensitive() {
        assert!(is_known_method("odm2*"));
        assert!(is_known_method("gfn2-xtb"));
        assert!(!is_known_method("B3LYP"));
        assert!(known_methods().contains("CCSD(T)*/CBS"));
    }

    #[test]
    fn missing_environment_is_a_configuration_error() {
        let err = resolve("GFN2-xTB", None, &MapLocator::new()).unwrap_err();
        assert!(matches!(err, ModelError::Configuration(_)));
    }

    #[test]
    fn unknown_method_is_a_configuration_error() {
        let err = resolve("not-a-method", None, &MapLocator::new()).unwrap_err();
        assert!(matches!(err, ModelError::Configuration(_)));
    }

    #[test]
    fn shared_semiempirical_methods_prefer_configured_program() {
        let sparrow = MapLocator::new().with_program("sparrowbin", "/opt/sparrow");
        let r = resolve("AM1", None, &sparrow).unwrap();
        assert_eq!(r.program, Program::Sparrow);

        let both = sparrow.clone().with_program("mndobin", "/opt/mndo");
        assert_eq!(resolve("AM1", None, &both).unwrap().program, Program::Mndo);

        // Sparrow-only method with only mndobin set has nowhere to go.
        let mndo = MapLocator::new().with_program("mndobin", "/opt/mndo");
        assert!(resolve("PM6", None, &mndo).is_err());
    }

    #[test]
    fn aiqm1_without_sparrow_uses_its_own_interface() {
        let mndo = MapLocator::new().with_program("mndobin", "/opt/mndo");
        let r = resolve("AIQM1", None, &mndo).unwrap();
        assert_eq!(r.program, Program::Aiqm1);
        assert_eq!(r.location, PathBuf::from("/opt/mndo"));

        let sparrow = MapLocator::new().with_program("sparrowbin", "/opt/sparrow");
        assert_eq!(resolve("aiqm1", None, &sparrow).unwrap().program, Program::Sparrow);
    }

    #[test]
    fn semiempirical_falls_back_to_default_mndo_location() {
        let locator = MapLocator::new()
            .with_variable("HOME", "/home/chem")
            .with_path("/home/chem/apps/mndo2020/mndo2020");
        let r = resolve("OM2", None, &locator).unwrap();
        assert_eq!(r.program, Program::Mndo);
        assert_eq!(r.location, PathBuf::from("/home/chem/apps/mndo2020/mndo2020"));

        let err = resolve("OM2", None, &MapLocator::new()).unwrap_err();
        assert!(matches!(err, ModelError::Configuration(_)));
    }

    #[test]
    fn explicit_program_must_implement_method() {
        let locator = MapLocator::new().with_program("xtbbin", "/opt/xtb");
        assert!(resolve("D4", Some(Program::Xtb), &locator).is_err());
        assert!(Method::resolve("D4", Some("turbomole"), BTreeMap::new(), &locator).is_err());
        let gaussian = MapLocator::new().with_program("gaussianbin", "/opt/g16");
        assert_eq!(
            resolve("B3LYP/6-31G*", Some(Program::Gaussian), &gaussian)
                .unwrap()
                .program,
            Program::Gaussian
        );
    }

    #[test]
    fn predict_writes_requested_properties() {
        let output = ProgramOutput {
            energy: Some(-76.4),
            energy_gradients: Some(vec![[0.1, 0.0, 0.0]; 3]),
            hessian: None,
        };
        let mut method =
            Method::with_backend("GFN2-xTB", Program::Xtb, BTreeMap::new(), Box::new(Fixed(output)));
        let mut mol = water();
        method
            .predict_molecule(&mut mol, &PredictionRequest::energy_and_gradients())
            .unwrap();
        assert_eq!(mol.scalar(ENERGY), Some(-76.4));
        assert_eq!(mol.atom_vectors(ENERGY_GRADIENTS).unwrap().len(), 3);
    }

    #[test]
    fn missing_output_is_a_backend_failure() {
        let mut method = Method::with_backend(
            "GFN2-xTB",
            Program::Xtb,
            BTreeMap::new(),
            Box::new(Fixed(ProgramOutput::default())),
        );
        let mut mol = water();
        let err = method
            .predict_molecule(&mut mol, &PredictionRequest::energy())
            .unwrap_err();
        match err {
            ModelError::BackendFailure { method, property } => {
                assert_eq!(method, "GFN2-xTB");
                assert_eq!(property, ENERGY);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!mol.has_property(ENERGY));
    }

    #[test]
    fn record_keeps_only_explicit_program() {
        let locator = MapLocator::new().with_program("xtbbin", "/opt/xtb");
        let implicit = Method::resolve("GFN2-xTB", None, BTreeMap::new(), &locator).unwrap();
        match implicit.to_record().unwrap() {
            ModelRecord::Method { program, .. } => assert!(program.is_none()),
            other => panic!("unexpected record {other:?}"),
        }
        let explicit = Method::resolve("GFN2-xTB", Some("xtb"), BTreeMap::new(), &locator).unwrap();
        match explicit.to_record().unwrap() {
            ModelRecord::Method { program, .. } => assert_eq!(program.as_deref(), Some("xtb")),
            other => panic!("unexpected record {other:?}"),
        }
    }
}
