use std::sync::Arc;

use super::networks::AniNetworks;
use crate::core::models::molecule::Molecule;
use crate::engine::error::ModelError;
use crate::engine::model::{Model, PredictionRequest};
use crate::engine::record::ModelRecord;
use crate::engine::tree::{ModelTree, Operator};

/// One member of a network ensemble, usable as an independent model.
#[derive(Debug, Clone)]
pub struct AniChild {
    networks: Arc<AniNetworks>,
    member: usize,
    nthreads: Option<usize>,
}

impl AniChild {
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidArgument`] if the ensemble has no member `member`.
    pub fn new(networks: Arc<AniNetworks>, member: usize) -> Result<Self, ModelError> {
        if member >= networks.member_count() {
            return Err(ModelError::InvalidArgument(format!(
                "ensemble member {member} does not exist ({} members)",
                networks.member_count()
            )));
        }
        Ok(Self {
            networks,
            member,
            nthreads: None,
        })
    }

    pub fn member(&self) -> usize {
        self.member
    }

    /// Wraps this member as a `predict` leaf named `name`.
    pub fn node(self, name: &str) -> ModelTree {
        ModelTree::leaf(name, Box::new(self))
    }
}

impl Model for AniChild {
    fn kind(&self) -> &'static str {
        "ani_child"
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
        self.networks
            .predict_all(Some(self.member), molecules, &targets, self.nthreads)
    }

    fn set_num_threads(&mut self, nthreads: usize) {
        self.nthreads = Some(nthreads);
    }

    fn config_multiprocessing(&mut self) {
        self.nthreads = Some(1);
    }

    fn to_record(&self) -> Result<ModelRecord, ModelError> {
        Err(ModelError::NotImplemented {
            model: self.kind(),
            operation: "to_record",
        })
    }
}

/// Builds the tree `{name}: average({name}_nn0, {name}_nn1, ...)`, or with a dispersion
/// term `{name}: sum({name}_nn: average(...), dispersion)`.
pub(crate) fn ensemble_tree(
    networks: Arc<AniNetworks>,
    name: &str,
    dispersion: Option<(&str, Box<dyn Model>)>,
    nthreads: Option<usize>,
) -> Result<ModelTree, ModelError> {
    let children = (0..networks.member_count())
        .map(|k| {
            let mut child = AniChild::new(Arc::clone(&networks), k)?;
            child.nthreads = nthreads;
            Ok(child.node(&format!("{name}_nn{k}")))
        })
        .collect::<Result<Vec<_>, ModelError>>()?;
    match dispersion {
        None => ModelTree::combine(name, Operator::Average, children),
        Some((dispersion_name, model)) => {
            let average = ModelTree::combine(&format!("{name}_nn"), Operator::Average, children)?;
            ModelTree::combine(
                name,
                Operator::Sum,
                vec![average, ModelTree::leaf(dispersion_name, model)],
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::molecule::{ENERGY, ENERGY_GRADIENTS};
    use crate::engine::ani::networks::tests::{methanol_like, small_networks};
    use crate::engine::tree::STANDARD_DEVIATION_SUFFIX;

    #[derive(Debug)]
    struct Constant(f64);

    impl Model for Constant {
        fn kind(&self) -> &'static str {
            "constant"
        }

        fn predict_batch(
            &mut self,
            molecules: &mut [Molecule],
            _request: &PredictionRequest,
        ) -> Result<(), ModelError> {
            for m in molecules {
                m.set_scalar(ENERGY, self.0);
            }
            Ok(())
        }

        fn to_record(&self) -> Result<ModelRecord, ModelError> {
            Err(ModelError::NotImplemented {
                model: "constant",
                operation: "to_record",
            })
        }
    }

    #[test]
    fn child_predicts_its_member_only() {
        let networks = Arc::new(small_networks(3, 4));
        let mut child = AniChild::new(Arc::clone(&networks), 1).unwrap();
        let mut m = methanol_like();
        child.predict_molecule(&mut m, &PredictionRequest::new()).unwrap();
        let expected = networks.evaluate(Some(1), &m, false).unwrap().0;
        assert_eq!(m.scalar(ENERGY), Some(expected));
        assert!(AniChild::new(networks, 3).is_err());
    }

    #[test]
    fn ensemble_tree_averages_members_and_records_spread() {
        let networks = Arc::new(small_networks(3, 4));
        let mut tree = ensemble_tree(Arc::clone(&networks), "ens", None, None).unwrap();
        let mut m = methanol_like();
        tree.predict_molecule(&mut m, &PredictionRequest::energy_and_gradients())
            .unwrap();
        let (mean, gradient) = networks.evaluate(None, &m, true).unwrap();
        assert!((m.scalar(ENERGY).unwrap() - mean).abs() < 1e-10);
        let predicted: Vec<f64> = m
            .atom_vectors(ENERGY_GRADIENTS)
            .unwrap()
            .iter()
            .flat_map(|g| [g.x, g.y, g.z])
            .collect();
        for (a, b) in predicted.iter().zip(gradient.unwrap()) {
            assert!((a - b).abs() < 1e-10);
        }
        let node = m.node_results("ens").unwrap();
        let spread = format!("{ENERGY}{STANDARD_DEVIATION_SUFFIX}");
        assert!(node.get(&spread).and_then(|v| v.as_scalar()).unwrap() > 0.0);
        assert!(m.node_results("ens_nn2").is_some());
    }

    #[test]
    fn dispersion_term_is_summed_with_the_average() {
        let networks = Arc::new(small_networks(2, 4));
        let mut tree = ensemble_tree(
            Arc::clone(&networks),
            "ens",
            Some(("d4_wb97x", Box::new(Constant(-0.25)))),
            None,
        )
        .unwrap();
        let mut m = methanol_like();
        tree.predict_molecule(&mut m, &PredictionRequest::energy()).unwrap();
        let mean = networks.evaluate(None, &m, false).unwrap().0;
        assert!((m.scalar(ENERGY).unwrap() - (mean - 0.25)).abs() < 1e-10);
        assert!(m.node_results("ens_nn").is_some());
        assert!(m.node_results("d4_wb97x").is_some());
    }
}
