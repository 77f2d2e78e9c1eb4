//! Explicit parameter containers
//!
//! The live model and its meta clone index weights by the same typed
//! [`ParamId`]s, so the inner update is a plain map from ids to tensors rather
//! than a walk over nested modules.

use std::collections::BTreeMap;
use std::fmt;

use candle_core::{Device, Tensor, Var};
use rand::rngs::StdRng;

use crate::error::{Error, Result};
use crate::utils::init;

/// Which feature path a parameter belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Branch {
    /// Path shared by every task
    Shared,
    /// Path owned by one task
    Task(usize),
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Branch::Shared => f.write_str("shared"),
            Branch::Task(t) => write!(f, "task{t}"),
        }
    }
}

/// Typed parameter identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParamId {
    /// Backbone-defined slot of one branch
    Backbone {
        /// Owning branch
        branch: Branch,
        /// Backbone-local slot number
        slot: usize,
    },
    /// Hidden projection weight `[hidden, feature]`
    HiddenWeight(Branch),
    /// Hidden projection bias `[hidden]`
    HiddenBias(Branch),
    /// Task classifier `[hidden, output]`
    Classifier(usize),
}

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamId::Backbone { branch, slot } => write!(f, "backbone.{branch}.{slot}"),
            ParamId::HiddenWeight(branch) => write!(f, "hidden.{branch}.weight"),
            ParamId::HiddenBias(branch) => write!(f, "hidden.{branch}.bias"),
            ParamId::Classifier(task) => write!(f, "classifier.task{task}"),
        }
    }
}

/// Read access to a set of weights by id
pub trait WeightLookup {
    /// Tensor stored under `id`
    fn weight(&self, id: ParamId) -> Result<&Tensor>;
}

fn missing(id: ParamId) -> Error {
    Error::model(format!("no parameter registered under `{id}`"))
}

/// Trainable weights of a model instance
#[derive(Debug, Default)]
pub struct ParamStore {
    vars: BTreeMap<ParamId, Var>,
}

impl ParamStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parameter; ids must be unique
    pub fn insert(&mut self, id: ParamId, value: &Tensor) -> Result<()> {
        if self.vars.contains_key(&id) {
            return Err(Error::model(format!("parameter `{id}` registered twice")));
        }
        self.vars.insert(id, Var::from_tensor(value)?);
        Ok(())
    }

    /// Variable stored under `id`
    pub fn var(&self, id: ParamId) -> Result<&Var> {
        self.vars.get(&id).ok_or_else(|| missing(id))
    }

    /// Ids and variables in id order
    pub fn iter(&self) -> impl Iterator<Item = (&ParamId, &Var)> {
        self.vars.iter()
    }

    /// All variables in id order, for optimizers
    pub fn vars(&self) -> Vec<Var> {
        self.vars.values().cloned().collect()
    }

    /// Parameter ids in order
    pub fn ids(&self) -> Vec<ParamId> {
        self.vars.keys().copied().collect()
    }

    /// Number of tensors
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether no parameters are registered
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Total number of scalar weights
    pub fn num_elements(&self) -> usize {
        self.vars.values().map(|v| v.elem_count()).sum()
    }

    /// Independent copy: every tensor gets fresh storage, so updating the copy
    /// never touches the original
    pub fn deep_clone(&self) -> Result<Self> {
        let mut vars = BTreeMap::new();
        for (id, var) in &self.vars {
            // `from_tensor` allocates new storage for non-variable inputs
            let copy = Var::from_tensor(&var.as_tensor().detach())?;
            vars.insert(*id, copy);
        }
        Ok(Self { vars })
    }

    /// Host copy of every tensor, flattened
    pub fn snapshot(&self) -> Result<BTreeMap<ParamId, Vec<f32>>> {
        self.vars
            .iter()
            .map(|(id, var)| Ok((*id, var.as_tensor().flatten_all()?.to_vec1::<f32>()?)))
            .collect()
    }
}

impl WeightLookup for ParamStore {
    fn weight(&self, id: ParamId) -> Result<&Tensor> {
        self.vars.get(&id).map(Var::as_tensor).ok_or_else(|| missing(id))
    }
}

/// One-step-ahead weights produced by the inner update. Tensors here are
/// graph nodes, not leaves: differentiating through them reaches both the
/// clone's variables and the gate parameters.
#[derive(Debug, Default)]
pub struct FastWeights {
    tensors: BTreeMap<ParamId, Tensor>,
}

impl FastWeights {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the updated tensor for `id`
    pub fn insert(&mut self, id: ParamId, tensor: Tensor) {
        self.tensors.insert(id, tensor);
    }

    /// Number of tensors
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

impl WeightLookup for FastWeights {
    fn weight(&self, id: ParamId) -> Result<&Tensor> {
        self.tensors.get(&id).ok_or_else(|| missing(id))
    }
}

/// Seeded initializer used by the model and its backbones to register weights
pub struct ParamInit<'a> {
    store: &'a mut ParamStore,
    rng: &'a mut StdRng,
    device: &'a Device,
}

impl<'a> ParamInit<'a> {
    /// Initializer writing into `store`
    pub fn new(store: &'a mut ParamStore, rng: &'a mut StdRng, device: &'a Device) -> Self {
        Self { store, rng, device }
    }

    /// Register a N(mean, std) tensor
    pub fn normal(&mut self, id: ParamId, shape: &[usize], mean: f64, std: f64) -> Result<()> {
        let value = init::normal(shape, mean, std, self.rng, self.device)?;
        self.store.insert(id, &value)
    }

    /// Register a constant tensor
    pub fn constant(&mut self, id: ParamId, shape: &[usize], value: f32) -> Result<()> {
        let value = init::constant(shape, value, self.device)?;
        self.store.insert(id, &value)
    }

    /// Target device
    pub fn device(&self) -> &Device {
        self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn sample_store() -> ParamStore {
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(3);
        let mut store = ParamStore::new();
        let mut init = ParamInit::new(&mut store, &mut rng, &device);
        init.normal(ParamId::HiddenWeight(Branch::Shared), &[4, 3], 0.0, 0.1)
            .unwrap();
        init.constant(ParamId::HiddenBias(Branch::Shared), &[4], 0.1)
            .unwrap();
        init.normal(ParamId::Classifier(0), &[4, 2], 0.0, 0.1).unwrap();
        store
    }

    #[test]
    fn test_display_ids() {
        assert_eq!(
            ParamId::Backbone { branch: Branch::Task(2), slot: 1 }.to_string(),
            "backbone.task2.1"
        );
        assert_eq!(ParamId::HiddenBias(Branch::Shared).to_string(), "hidden.shared.bias");
        assert_eq!(ParamId::Classifier(0).to_string(), "classifier.task0");
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut store = sample_store();
        let t = Tensor::zeros(2, candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(store.insert(ParamId::Classifier(0), &t).is_err());
    }

    #[test]
    fn test_deep_clone_does_not_alias() {
        let store = sample_store();
        let before = store.snapshot().unwrap();

        let clone = store.deep_clone().unwrap();
        assert_eq!(clone.snapshot().unwrap(), before);
        for (_, var) in clone.iter() {
            let bumped = (var.as_tensor().detach() + 1.0).unwrap();
            var.set(&bumped).unwrap();
        }

        assert_eq!(store.snapshot().unwrap(), before);
        assert_ne!(clone.snapshot().unwrap(), before);
    }

    #[test]
    fn test_lookup_missing_id() {
        let store = sample_store();
        assert!(store.weight(ParamId::Classifier(5)).is_err());
        assert!(FastWeights::new().weight(ParamId::Classifier(0)).is_err());
    }

    #[test]
    fn test_num_elements() {
        let store = sample_store();
        assert_eq!(store.len(), 3);
        assert_eq!(store.num_elements(), 12 + 4 + 8);
    }
}
