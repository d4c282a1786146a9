use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, trace};

use super::error::ModelError;
use super::methods::ProgramLocator;
use super::model::{Model, PredictionRequest, PredictionTargets};
use super::record::{ModelRecord, from_record};
use crate::core::models::molecule::Molecule;
use crate::core::models::property::PropertyValue;

new_key_type! {
    pub struct NodeId;
}

/// Suffix of the spread recorded by `average` nodes next to each averaged property.
pub const STANDARD_DEVIATION_SUFFIX: &str = "_standard_deviation";

/// How a node produces its results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    /// Leaf node: call the wrapped model.
    Predict,
    /// Elementwise sum over children.
    Sum,
    /// Elementwise mean over children.
    Average,
}

struct Node {
    name: String,
    /// Non-owning back-reference set when the node is attached.
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    operator: Operator,
    model: Option<Box<dyn Model>>,
}

/// A composite model combining sibling models with `sum`/`average` operators.
///
/// Nodes live in an arena owned by the tree. Children are owned through the arena; the
/// parent link is a plain id used only for lookups, so the structure has no reference
/// cycles. A node may be attached under several parents, in which case it is evaluated
/// once per prediction and its results are shared.
///
/// Predictions are written into a per-node container on every molecule (see
/// [`Molecule::node_results`]) and the root's combined values are finally copied onto the
/// molecule's top-level properties, so callers cannot tell a tree from a leaf model.
pub struct ModelTree {
    nodes: SlotMap<NodeId, Node>,
    root: NodeId,
}

impl fmt::Debug for ModelTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelTree")
            .field("root", &self.nodes[self.root].name)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

impl ModelTree {
    /// Creates a tree whose root combines children with `operator`.
    ///
    /// Children are added with [`ModelTree::add_leaf`], [`ModelTree::add_node`] or
    /// [`ModelTree::graft`]; prediction fails until the root has at least one child.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidArgument`] if `operator` is [`Operator::Predict`].
    pub fn new(name: &str, operator: Operator) -> Result<Self, ModelError> {
        if operator == Operator::Predict {
            return Err(ModelError::InvalidArgument(format!(
                "node '{name}' has no model, so it cannot use the predict operator"
            )));
        }
        let mut nodes = SlotMap::with_key();
        let root = nodes.insert(Node {
            name: name.to_string(),
            parent: None,
            children: Vec::new(),
            operator,
            model: None,
        });
        Ok(Self { nodes, root })
    }

    /// Creates a single-node tree wrapping `model`.
    pub fn leaf(name: &str, model: Box<dyn Model>) -> Self {
        let mut nodes = SlotMap::with_key();
        let root = nodes.insert(Node {
            name: name.to_string(),
            parent: None,
            children: Vec::new(),
            operator: Operator::Predict,
            model: Some(model),
        });
        Self { nodes, root }
    }

    /// Creates a tree whose root combines the given subtrees.
    pub fn combine(
        name: &str,
        operator: Operator,
        children: Vec<ModelTree>,
    ) -> Result<Self, ModelError> {
        let mut tree = Self::new(name, operator)?;
        let root = tree.root;
        for child in children {
            tree.graft(root, child)?;
        }
        Ok(tree)
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn name(&self, id: NodeId) -> Option<&str> {
        self.nodes.get(id).map(|n| n.name.as_str())
    }

    pub fn operator(&self, id: NodeId) -> Option<Operator> {
        self.nodes.get(id).map(|n| n.operator)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id).and_then(|n| n.parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes.get(id).map_or(&[], |n| n.children.as_slice())
    }

    /// Returns the other children of this node's parent.
    pub fn siblings(&self, id: NodeId) -> Vec<NodeId> {
        self.parent(id)
            .map(|p| {
                self.children(p)
                    .iter()
                    .copied()
                    .filter(|&c| c != id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Finds a node by name.
    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|(_, n)| n.name == name)
            .map(|(id, _)| id)
    }

    /// Returns the model wrapped by a leaf node.
    pub fn model_mut(&mut self, id: NodeId) -> Option<&mut (dyn Model + 'static)> {
        self.nodes.get_mut(id).and_then(|n| n.model.as_deref_mut())
    }

    fn check_parent(&self, parent: NodeId, name: &str) -> Result<(), ModelError> {
        let node = self
            .nodes
            .get(parent)
            .ok_or_else(|| ModelError::InvalidArgument("parent node does not exist".into()))?;
        if node.operator == Operator::Predict {
            return Err(ModelError::InvalidArgument(format!(
                "leaf node '{}' cannot have children",
                node.name
            )));
        }
        if self.find(name).is_some() {
            return Err(ModelError::InvalidArgument(format!(
                "a node named '{name}' already exists in the tree"
            )));
        }
        Ok(())
    }

    fn push_child(&mut self, parent: NodeId, node: Node) -> NodeId {
        let id = self.nodes.insert(Node {
            parent: Some(parent),
            ..node
        });
        self.nodes[parent].children.push(id);
        id
    }

    /// Adds a leaf wrapping `model` under `parent`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidArgument`] if `parent` is a leaf or the name is taken.
    pub fn add_leaf(
        &mut self,
        parent: NodeId,
        name: &str,
        model: Box<dyn Model>,
    ) -> Result<NodeId, ModelError> {
        self.check_parent(parent, name)?;
        Ok(self.push_child(
            parent,
            Node {
                name: name.to_string(),
                parent: None,
                children: Vec::new(),
                operator: Operator::Predict,
                model: Some(model),
            },
        ))
    }

    /// Adds an empty combining node under `parent`.
    pub fn add_node(
        &mut self,
        parent: NodeId,
        name: &str,
        operator: Operator,
    ) -> Result<NodeId, ModelError> {
        if operator == Operator::Predict {
            return Err(ModelError::InvalidArgument(format!(
                "node '{name}' has no model, so it cannot use the predict operator"
            )));
        }
        self.check_parent(parent, name)?;
        Ok(self.push_child(
            parent,
            Node {
                name: name.to_string(),
                parent: None,
                children: Vec::new(),
                operator,
                model: None,
            },
        ))
    }

    /// Moves every node of `subtree` into this tree under `parent`.
    ///
    /// # Return
    ///
    /// The id of the grafted subtree's root in this tree.
    pub fn graft(&mut self, parent: NodeId, mut subtree: ModelTree) -> Result<NodeId, ModelError> {
        for (_, node) in &subtree.nodes {
            self.check_parent(parent, &node.name)?;
        }
        let ids: Vec<NodeId> = subtree.nodes.keys().collect();
        let mut mapping = slotmap::SecondaryMap::new();
        for old in &ids {
            if let Some(node) = subtree.nodes.remove(*old) {
                let new = self.nodes.insert(node);
                mapping.insert(*old, new);
            }
        }
        let moved: Vec<NodeId> = mapping.values().copied().collect();
        for new in moved {
            let node = &self.nodes[new];
            let parent = node.parent.and_then(|p| mapping.get(p).copied());
            let children = node
                .children
                .iter()
                .filter_map(|c| mapping.get(*c).copied())
                .collect();
            let node = &mut self.nodes[new];
            node.parent = parent;
            node.children = children;
        }
        let grafted_root = mapping.get(subtree.root).copied().ok_or_else(|| {
            ModelError::InvalidArgument("grafted tree has no root".into())
        })?;
        self.nodes[grafted_root].parent = Some(parent);
        self.nodes[parent].children.push(grafted_root);
        Ok(grafted_root)
    }

    /// Attaches an existing node under a second parent. Its parent link moves to `parent`.
    pub fn attach(&mut self, parent: NodeId, child: NodeId) -> Result<(), ModelError> {
        if !self.nodes.contains_key(child) || !self.nodes.contains_key(parent) {
            return Err(ModelError::InvalidArgument("node does not exist".into()));
        }
        if self.nodes[parent].operator == Operator::Predict {
            return Err(ModelError::InvalidArgument(format!(
                "leaf node '{}' cannot have children",
                self.nodes[parent].name
            )));
        }
        if self.reachable(child).contains(&parent) {
            return Err(ModelError::InvalidArgument(format!(
                "attaching '{}' under '{}' would create a cycle",
                self.nodes[child].name, self.nodes[parent].name
            )));
        }
        if !self.nodes[parent].children.contains(&child) {
            self.nodes[parent].children.push(child);
        }
        self.nodes[child].parent = Some(parent);
        Ok(())
    }

    fn reachable(&self, from: NodeId) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if seen.insert(id) {
                stack.extend(self.children(id).iter().copied());
            }
        }
        seen
    }

    /// Checks that every node is either a leaf with a model or a combining node with
    /// children.
    pub fn validate(&self) -> Result<(), ModelError> {
        for id in self.reachable(self.root) {
            let node = &self.nodes[id];
            let leaf = node.children.is_empty()
                && node.model.is_some()
                && node.operator == Operator::Predict;
            let composite = !node.children.is_empty()
                && node.model.is_none()
                && node.operator != Operator::Predict;
            if !(leaf || composite) {
                return Err(ModelError::InvalidArgument(format!(
                    "node '{}' must either wrap a model with the predict operator or have children",
                    node.name
                )));
            }
        }
        Ok(())
    }

    fn prepare_containers(&self, molecules: &mut [Molecule]) {
        let reachable = self.reachable(self.root);
        for molecule in molecules.iter_mut() {
            molecule.clear_node_results(reachable.iter().map(|&id| self.nodes[id].name.as_str()));
            for &id in &reachable {
                let node = &self.nodes[id];
                let container = molecule.node_results_mut(&node.name);
                container.parent = node.parent.map(|p| self.nodes[p].name.clone());
                container.children = node
                    .children
                    .iter()
                    .map(|&c| self.nodes[c].name.clone())
                    .collect();
            }
        }
    }

    fn evaluate(
        &mut self,
        id: NodeId,
        molecules: &mut [Molecule],
        request: &PredictionRequest,
        targets: &PredictionTargets,
        done: &mut HashSet<NodeId>,
    ) -> Result<(), ModelError> {
        if done.contains(&id) {
            return Ok(());
        }
        let children = self.nodes[id].children.clone();
        if children.is_empty() {
            let node = &mut self.nodes[id];
            let name = node.name.clone();
            trace!(node = %name, "Predicting leaf");
            if let Some(model) = node.model.as_mut() {
                model.predict_batch(molecules, request)?;
            }
            for molecule in molecules.iter_mut() {
                let values: Vec<(String, PropertyValue)> = targets
                    .names()
                    .into_iter()
                    .filter_map(|p| molecule.property(p).map(|v| (p.to_string(), v.clone())))
                    .collect();
                let container = molecule.node_results_mut(&name);
                for (p, v) in values {
                    container.set(&p, v);
                }
            }
        } else {
            for &child in &children {
                self.evaluate(child, molecules, request, targets, done)?;
            }
            let node = &self.nodes[id];
            let child_names: Vec<&str> = children.iter().map(|&c| self.nodes[c].name.as_str()).collect();
            for molecule in molecules.iter_mut() {
                let mut combined = Vec::new();
                for property in targets.names() {
                    let values = child_names
                        .iter()
                        .map(|c| molecule.node_results(c).and_then(|r| r.get(property)))
                        .collect::<Option<Vec<&PropertyValue>>>()
                        .ok_or_else(|| ModelError::BackendFailure {
                            method: node.name.clone(),
                            property: property.to_string(),
                        })?;
                    let incompatible = || {
                        ModelError::InvalidArgument(format!(
                            "children of '{}' report '{property}' with different shapes",
                            node.name
                        ))
                    };
                    match node.operator {
                        Operator::Sum => {
                            combined.push((
                                property.to_string(),
                                PropertyValue::sum_of(&values).ok_or_else(incompatible)?,
                            ));
                        }
                        Operator::Average => {
                            combined.push((
                                property.to_string(),
                                PropertyValue::mean_of(&values).ok_or_else(incompatible)?,
                            ));
                            combined.push((
                                format!("{property}{STANDARD_DEVIATION_SUFFIX}"),
                                PropertyValue::standard_deviation_of(&values)
                                    .ok_or_else(incompatible)?,
                            ));
                        }
                        Operator::Predict => {}
                    }
                }
                let container = molecule.node_results_mut(&node.name);
                for (p, v) in combined {
                    container.set(&p, v);
                }
            }
        }
        done.insert(id);
        Ok(())
    }

    /// Rebuilds a tree from its record.
    pub fn from_record(
        record: ModelRecord,
        locator: &dyn ProgramLocator,
    ) -> Result<Self, ModelError> {
        let ModelRecord::ModelTreeNode {
            name,
            children,
            operator,
            model,
        } = record
        else {
            return Err(ModelError::InvalidArgument(
                "record does not describe a model tree node".into(),
            ));
        };
        match (children.filter(|c| !c.is_empty()), model) {
            (None, Some(model)) if operator == Operator::Predict => {
                Ok(Self::leaf(&name, from_record(*model, locator)?))
            }
            (Some(children), None) => {
                let subtrees = children
                    .into_iter()
                    .map(|c| Self::from_record(c, locator))
                    .collect::<Result<Vec<_>, _>>()?;
                Self::combine(&name, operator, subtrees)
            }
            _ => Err(ModelError::InvalidArgument(format!(
                "node '{name}' must either wrap a model with the predict operator or have children"
            ))),
        }
    }

    fn node_record(&self, id: NodeId) -> Result<ModelRecord, ModelError> {
        let node = &self.nodes[id];
        let children = if node.children.is_empty() {
            None
        } else {
            Some(
                node.children
                    .iter()
                    .map(|&c| self.node_record(c))
                    .collect::<Result<Vec<_>, _>>()?,
            )
        };
        let model = node
            .model
            .as_ref()
            .map(|m| m.to_record().map(Box::new))
            .transpose()?;
        Ok(ModelRecord::ModelTreeNode {
            name: node.name.clone(),
            children,
            operator: node.operator,
            model,
        })
    }

    fn leaf_models_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Model>> {
        self.nodes.values_mut().filter_map(|n| n.model.as_mut())
    }
}

impl Model for ModelTree {
    fn kind(&self) -> &'static str {
        "model_tree_node"
    }

    fn predict_batch(
        &mut self,
        molecules: &mut [Molecule],
        request: &PredictionRequest,
    ) -> Result<(), ModelError> {
        self.validate()?;
        let request = if request.targets().is_empty() {
            request.clone().with_energy(true)
        } else {
            request.clone()
        };
        let targets = request.targets();
        debug!(
            root = %self.nodes[self.root].name,
            molecules = molecules.len(),
            "Predicting with model tree"
        );
        self.prepare_containers(molecules);
        let mut done = HashSet::new();
        self.evaluate(self.root, molecules, &request, &targets, &mut done)?;

        let root = self.nodes[self.root].name.clone();
        for molecule in molecules.iter_mut() {
            let values: Vec<(String, PropertyValue)> = targets
                .names()
                .into_iter()
                .filter_map(|p| {
                    molecule
                        .node_results(&root)
                        .and_then(|r| r.get(p))
                        .map(|v| (p.to_string(), v.clone()))
                })
                .collect();
            for (p, v) in values {
                molecule.set_property(&p, v);
            }
        }
        Ok(())
    }

    fn set_num_threads(&mut self, nthreads: usize) {
        for model in self.leaf_models_mut() {
            model.set_num_threads(nthreads);
        }
    }

    fn config_multiprocessing(&mut self) {
        for model in self.leaf_models_mut() {
            model.config_multiprocessing();
        }
    }

    fn reset(&mut self) -> Result<(), ModelError> {
        for model in self.leaf_models_mut() {
            model.reset()?;
        }
        Ok(())
    }

    fn to_record(&self) -> Result<ModelRecord, ModelError> {
        self.node_record(self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::molecule::{ENERGY, ENERGY_GRADIENTS};
    use nalgebra::Vector3;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        energy: f64,
        calls: Arc<AtomicUsize>,
    }

    impl Model for Fixed {
        fn kind(&self) -> &'static str {
            "fixed"
        }

        fn predict_batch(
            &mut self,
            molecules: &mut [Molecule],
            request: &PredictionRequest,
        ) -> Result<(), ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let targets = request.targets();
            for m in molecules {
                if let Some(p) = &targets.property {
                    m.set_scalar(p, self.energy);
                }
                if let Some(p) = &targets.xyz_derivative_property {
                    let g = vec![Vector3::new(self.energy, 0.0, -self.energy); m.atom_count()];
                    m.set_atom_vectors(p, g);
                }
            }
            Ok(())
        }

        fn to_record(&self) -> Result<ModelRecord, ModelError> {
            Err(ModelError::NotImplemented {
                model: "fixed",
                operation: "to_record",
            })
        }
    }

    fn fixed(energy: f64) -> (Box<dyn Model>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Box::new(Fixed {
                energy,
                calls: calls.clone(),
            }),
            calls,
        )
    }

    fn h2() -> Molecule {
        Molecule::from_numbers_and_coordinates(&[(1, [0.0; 3]), (1, [0.0, 0.0, 0.74])])
    }

    #[test]
    fn new_rejects_predict_operator_without_model() {
        assert!(ModelTree::new("root", Operator::Predict).is_err());
    }

    #[test]
    fn empty_composite_fails_validation() {
        let mut tree = ModelTree::new("root", Operator::Sum).unwrap();
        let mut m = h2();
        assert!(matches!(
            tree.predict_molecule(&mut m, &PredictionRequest::energy()),
            Err(ModelError::InvalidArgument(_))
        ));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut tree = ModelTree::new("root", Operator::Sum).unwrap();
        let root = tree.root();
        tree.add_leaf(root, "a", fixed(1.0).0).unwrap();
        assert!(tree.add_leaf(root, "a", fixed(2.0).0).is_err());
        assert!(tree.add_leaf(root, "root", fixed(2.0).0).is_err());
    }

    #[test]
    fn leaf_cannot_take_children() {
        let mut tree = ModelTree::new("root", Operator::Sum).unwrap();
        let root = tree.root();
        let leaf = tree.add_leaf(root, "a", fixed(1.0).0).unwrap();
        assert!(tree.add_leaf(leaf, "b", fixed(1.0).0).is_err());
    }

    #[test]
    fn parent_links_and_siblings() {
        let mut tree = ModelTree::new("root", Operator::Average).unwrap();
        let root = tree.root();
        let a = tree.add_leaf(root, "a", fixed(1.0).0).unwrap();
        let b = tree.add_leaf(root, "b", fixed(2.0).0).unwrap();
        assert_eq!(tree.parent(a), Some(root));
        assert_eq!(tree.siblings(a), vec![b]);
        assert_eq!(tree.find("b"), Some(b));
        assert_eq!(tree.parent(root), None);
    }

    #[test]
    fn nested_sum_of_average() {
        let mut tree = ModelTree::new("total", Operator::Sum).unwrap();
        let root = tree.root();
        let ensemble = tree.add_node(root, "ensemble", Operator::Average).unwrap();
        tree.add_leaf(ensemble, "nn0", fixed(1.0).0).unwrap();
        tree.add_leaf(ensemble, "nn1", fixed(3.0).0).unwrap();
        tree.add_leaf(root, "d4", fixed(0.5).0).unwrap();

        let mut m = h2();
        tree.predict_molecule(&mut m, &PredictionRequest::energy_and_gradients())
            .unwrap();
        assert_eq!(m.scalar(ENERGY), Some(2.5));
        let g = m.atom_vectors(ENERGY_GRADIENTS).unwrap();
        assert_eq!(g[0], Vector3::new(2.5, 0.0, -2.5));

        let ensemble = m.node_results("ensemble").unwrap();
        assert_eq!(ensemble.get(ENERGY), Some(&PropertyValue::Scalar(2.0)));
        assert_eq!(
            ensemble.get("energy_standard_deviation"),
            Some(&PropertyValue::Scalar(1.0))
        );
        assert_eq!(ensemble.parent.as_deref(), Some("total"));
        assert_eq!(ensemble.children, vec!["nn0".to_string(), "nn1".to_string()]);
        assert_eq!(
            m.node_results("d4").unwrap().get(ENERGY),
            Some(&PropertyValue::Scalar(0.5))
        );
    }

    #[test]
    fn three_leaves_sum_and_average_without_double_counting() {
        for (operator, expected) in [(Operator::Sum, 6.0), (Operator::Average, 2.0)] {
            let mut tree = ModelTree::new("root", operator).unwrap();
            let root = tree.root();
            for (i, e) in [1.0, 2.0, 3.0].into_iter().enumerate() {
                tree.add_leaf(root, &format!("leaf{i}"), fixed(e).0).unwrap();
            }
            let mut m = h2();
            let request = PredictionRequest::energy_and_gradients();
            tree.predict_molecule(&mut m, &request).unwrap();
            tree.predict_molecule(&mut m, &request).unwrap();
            assert_eq!(m.scalar(ENERGY), Some(expected));
            let g = m.atom_vectors(ENERGY_GRADIENTS).unwrap();
            assert_eq!(g[0], Vector3::new(expected, 0.0, -expected));
        }
    }

    #[test]
    fn shared_child_is_evaluated_once() {
        let (model, calls) = fixed(2.0);
        let mut tree = ModelTree::new("root", Operator::Sum).unwrap();
        let root = tree.root();
        let left = tree.add_node(root, "left", Operator::Sum).unwrap();
        let right = tree.add_node(root, "right", Operator::Sum).unwrap();
        let shared = tree.add_leaf(left, "shared", model).unwrap();
        tree.attach(right, shared).unwrap();
        assert_eq!(tree.parent(shared), Some(right));

        let mut m = h2();
        tree.predict_molecule(&mut m, &PredictionRequest::energy()).unwrap();
        assert_eq!(m.scalar(ENERGY), Some(4.0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn attach_rejects_cycles() {
        let mut tree = ModelTree::new("root", Operator::Sum).unwrap();
        let root = tree.root();
        let inner = tree.add_node(root, "inner", Operator::Sum).unwrap();
        assert!(tree.attach(inner, root).is_err());
    }

    #[test]
    fn combine_grafts_subtrees() {
        let a = ModelTree::leaf("a", fixed(1.0).0);
        let b = ModelTree::combine(
            "b",
            Operator::Average,
            vec![ModelTree::leaf("b0", fixed(2.0).0), ModelTree::leaf("b1", fixed(4.0).0)],
        )
        .unwrap();
        let mut tree = ModelTree::combine("root", Operator::Sum, vec![a, b]).unwrap();
        let b = tree.find("b").unwrap();
        assert_eq!(tree.parent(b), Some(tree.root()));
        assert_eq!(tree.children(b).len(), 2);

        let mut m = h2();
        tree.predict_molecule(&mut m, &PredictionRequest::energy()).unwrap();
        assert_eq!(m.scalar(ENERGY), Some(4.0));
    }

    #[test]
    fn single_leaf_tree_behaves_like_its_model() {
        let mut tree = ModelTree::leaf("only", fixed(-1.0).0);
        let mut m = h2();
        tree.predict_molecule(&mut m, &PredictionRequest::new()).unwrap();
        assert_eq!(m.scalar(ENERGY), Some(-1.0));
    }

    #[test]
    fn record_round_trip_shape() {
        let record: ModelRecord = serde_json::from_value(serde_json::json!({
            "type": "model_tree_node",
            "name": "root",
            "children": null,
            "operator": "sum",
            "model": null
        }))
        .unwrap();
        let err = ModelTree::from_record(record, &crate::engine::methods::MapLocator::new())
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidArgument(_)));
    }
}
