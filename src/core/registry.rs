//! State buffer registry.
//!
//! The registry is the single owner of every per-entity array, every scalar
//! parameter and every synapse connectivity record. Kernels never keep
//! references into it across dispatches; they resolve names once at bind time
//! and then read/write through the registry for the duration of a dispatch.

use std::fmt;

use hashbrown::HashMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ResourceError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ElementType {
    F32,
    I32,
    Bool,
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementType::F32 => write!(f, "f32"),
            ElementType::I32 => write!(f, "i32"),
            ElementType::Bool => write!(f, "bool"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    F32(f32),
    I32(i32),
    Bool(bool),
}

impl Value {
    pub fn zero(ty: ElementType) -> Self {
        match ty {
            ElementType::F32 => Value::F32(0.0),
            ElementType::I32 => Value::I32(0),
            ElementType::Bool => Value::Bool(false),
        }
    }

    pub fn element_type(&self) -> ElementType {
        match self {
            Value::F32(_) => ElementType::F32,
            Value::I32(_) => ElementType::I32,
            Value::Bool(_) => ElementType::Bool,
        }
    }

    /// Widen to `f32` for recording (`true` is 1.0).
    pub fn to_f32(self) -> f32 {
        match self {
            Value::F32(v) => v,
            Value::I32(v) => v as f32,
            Value::Bool(v) => {
                if v {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::F32(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

/// A typed per-entity array.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    F32(Vec<f32>),
    I32(Vec<i32>),
    Bool(Vec<bool>),
}

impl Column {
    pub fn zeroed(ty: ElementType, len: usize) -> Self {
        match ty {
            ElementType::F32 => Column::F32(vec![0.0; len]),
            ElementType::I32 => Column::I32(vec![0; len]),
            ElementType::Bool => Column::Bool(vec![false; len]),
        }
    }

    pub fn element_type(&self) -> ElementType {
        match self {
            Column::F32(_) => ElementType::F32,
            Column::I32(_) => ElementType::I32,
            Column::Bool(_) => ElementType::Bool,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Column::F32(v) => v.len(),
            Column::I32(v) => v.len(),
            Column::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, i: usize) -> Option<Value> {
        match self {
            Column::F32(v) => v.get(i).copied().map(Value::F32),
            Column::I32(v) => v.get(i).copied().map(Value::I32),
            Column::Bool(v) => v.get(i).copied().map(Value::Bool),
        }
    }

    /// Store `value` at `i`. Returns false when the types differ.
    pub(crate) fn set(&mut self, i: usize, value: Value) -> bool {
        match (self, value) {
            (Column::F32(v), Value::F32(x)) => v[i] = x,
            (Column::I32(v), Value::I32(x)) => v[i] = x,
            (Column::Bool(v), Value::Bool(x)) => v[i] = x,
            _ => return false,
        }
        true
    }

    fn zero_fill(&mut self) {
        match self {
            Column::F32(v) => v.iter_mut().for_each(|x| *x = 0.0),
            Column::I32(v) => v.iter_mut().for_each(|x| *x = 0),
            Column::Bool(v) => v.iter_mut().for_each(|x| *x = false),
        }
    }

    fn truncate(&mut self, len: usize) {
        match self {
            Column::F32(v) => v.truncate(len),
            Column::I32(v) => v.truncate(len),
            Column::Bool(v) => v.truncate(len),
        }
    }

    fn try_grow(&mut self, new_len: usize) -> Result<(), std::collections::TryReserveError> {
        let extra = new_len.saturating_sub(self.len());
        match self {
            Column::F32(v) => {
                v.try_reserve_exact(extra)?;
                v.resize(new_len, 0.0);
            }
            Column::I32(v) => {
                v.try_reserve_exact(extra)?;
                v.resize(new_len, 0);
            }
            Column::Bool(v) => {
                v.try_reserve_exact(extra)?;
                v.resize(new_len, false);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntitySetId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Neurons,
    Synapses {
        source: EntitySetId,
        target: EntitySetId,
    },
}

#[derive(Debug, Clone)]
pub struct EntitySet {
    name: String,
    count: usize,
    kind: EntityKind,
}

impl EntitySet {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }
}

/// Pre/post arrays of a synapse group plus the per-neuron back-references.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Connectivity {
    pub(crate) pre: Vec<u32>,
    pub(crate) post: Vec<u32>,
    pub(crate) pre_synapses: Vec<Vec<u32>>,
    pub(crate) post_synapses: Vec<Vec<u32>>,
}

impl Connectivity {
    fn sized(source_count: usize, target_count: usize) -> Self {
        Self {
            pre: Vec::new(),
            post: Vec::new(),
            pre_synapses: vec![Vec::new(); source_count],
            post_synapses: vec![Vec::new(); target_count],
        }
    }

    pub fn len(&self) -> usize {
        self.pre.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pre.is_empty()
    }

    pub fn pre(&self) -> &[u32] {
        &self.pre
    }

    pub fn post(&self) -> &[u32] {
        &self.post
    }

    /// Synapses whose presynaptic neuron is `i`, in creation order.
    pub fn synapses_from(&self, i: usize) -> &[u32] {
        self.pre_synapses.get(i).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Synapses whose postsynaptic neuron is `j`, in creation order.
    pub fn synapses_to(&self, j: usize) -> &[u32] {
        self.post_synapses.get(j).map(Vec::as_slice).unwrap_or(&[])
    }

    fn clear(&mut self) {
        self.pre.clear();
        self.post.clear();
        self.pre_synapses.iter_mut().for_each(Vec::clear);
        self.post_synapses.iter_mut().for_each(Vec::clear);
    }

    /// Every stored neuron index must fall inside its group.
    pub(crate) fn check(
        &self,
        name: &str,
        source_count: usize,
        target_count: usize,
    ) -> Result<(), ConfigError> {
        if self.pre.len() != self.post.len() {
            return Err(ConfigError::LengthMismatch {
                name: format!("{name}.post"),
                expected: self.pre.len(),
                found: self.post.len(),
            });
        }
        let out_of_range = |values: &[u32], count: usize| {
            values
                .iter()
                .find(|&&i| i as usize >= count)
                .map(|&i| ConfigError::ConnectivityOutOfRange {
                    synapses: name.to_string(),
                    index: i as usize,
                    count,
                })
        };
        if let Some(err) = out_of_range(&self.pre, source_count) {
            return Err(err);
        }
        if let Some(err) = out_of_range(&self.post, target_count) {
            return Err(err);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Variable {
    name: String,
    entity: EntitySetId,
    column: Column,
}

#[derive(Debug, Clone)]
struct Scalar {
    declared: Value,
    value: Value,
}

/// Where a bound name lives inside the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Entry {
    Variable(usize),
    Scalar(usize),
}

#[derive(Debug, Default)]
pub struct StateBuffers {
    entity_sets: Vec<EntitySet>,
    entity_index: HashMap<String, EntitySetId>,
    connectivity: HashMap<EntitySetId, Connectivity>,
    variables: Vec<Variable>,
    scalars: Vec<Scalar>,
    names: HashMap<String, Entry>,
}

impl StateBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Entity sets
    // =========================================================================

    pub fn declare_neurons(&mut self, name: &str, count: usize) -> Result<EntitySetId, ConfigError> {
        self.push_entity_set(name, count, EntityKind::Neurons)
    }

    /// Declare a synapse group between two neuron groups. It starts empty and
    /// only grows through the synapse builder.
    pub fn declare_synapses(
        &mut self,
        name: &str,
        source: &str,
        target: &str,
    ) -> Result<EntitySetId, ConfigError> {
        let source = self.entity_set(source)?;
        let target = self.entity_set(target)?;
        let id = self.push_entity_set(name, 0, EntityKind::Synapses { source, target })?;
        let conn = Connectivity::sized(self.count(source), self.count(target));
        self.connectivity.insert(id, conn);
        Ok(id)
    }

    fn push_entity_set(
        &mut self,
        name: &str,
        count: usize,
        kind: EntityKind,
    ) -> Result<EntitySetId, ConfigError> {
        if self.entity_index.contains_key(name) {
            return Err(ConfigError::Duplicate {
                name: name.to_string(),
            });
        }
        let id = EntitySetId(self.entity_sets.len());
        self.entity_sets.push(EntitySet {
            name: name.to_string(),
            count,
            kind,
        });
        self.entity_index.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn entity_set(&self, name: &str) -> Result<EntitySetId, ConfigError> {
        self.entity_index
            .get(name)
            .copied()
            .ok_or_else(|| ConfigError::UnknownEntitySet {
                name: name.to_string(),
            })
    }

    pub fn entity(&self, id: EntitySetId) -> &EntitySet {
        &self.entity_sets[id.0]
    }

    pub fn count(&self, id: EntitySetId) -> usize {
        self.entity_sets[id.0].count
    }

    /// Source and target groups of a synapse entity set.
    pub fn endpoints(&self, id: EntitySetId) -> Result<(EntitySetId, EntitySetId), ConfigError> {
        match self.entity(id).kind {
            EntityKind::Synapses { source, target } => Ok((source, target)),
            EntityKind::Neurons => Err(ConfigError::NotSynapses {
                name: self.entity(id).name.clone(),
            }),
        }
    }

    pub fn connectivity(&self, id: EntitySetId) -> Result<&Connectivity, ConfigError> {
        self.connectivity
            .get(&id)
            .ok_or_else(|| ConfigError::NotSynapses {
                name: self.entity(id).name.clone(),
            })
    }

    pub(crate) fn connectivity_mut(
        &mut self,
        id: EntitySetId,
    ) -> Result<&mut Connectivity, ConfigError> {
        let name = &self.entity_sets[id.0].name;
        self.connectivity
            .get_mut(&id)
            .ok_or_else(|| ConfigError::NotSynapses { name: name.clone() })
    }

    /// Set a synapse group's count to its connectivity length and grow every
    /// array of that group to match, zero-filling the new slots.
    pub fn sync_entity_set(&mut self, id: EntitySetId) -> Result<()> {
        let count = self.connectivity(id)?.len();
        self.entity_sets[id.0].count = count;
        for var in self.variables.iter_mut().filter(|v| v.entity == id) {
            if var.column.len() < count {
                var.column
                    .try_grow(count)
                    .map_err(|_| ResourceError::Allocation {
                        name: var.name.clone(),
                        requested: count,
                    })?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Variables and scalars
    // =========================================================================

    /// Declare a zero-filled array with one element per entity.
    pub fn declare(
        &mut self,
        name: &str,
        entity: EntitySetId,
        ty: ElementType,
    ) -> Result<VarId, ConfigError> {
        self.check_free(name)?;
        let idx = self.variables.len();
        self.variables.push(Variable {
            name: name.to_string(),
            entity,
            column: Column::zeroed(ty, self.count(entity)),
        });
        self.names.insert(name.to_string(), Entry::Variable(idx));
        Ok(VarId(idx))
    }

    pub fn declare_scalar(&mut self, name: &str, value: Value) -> Result<(), ConfigError> {
        self.check_free(name)?;
        let idx = self.scalars.len();
        self.scalars.push(Scalar {
            declared: value,
            value,
        });
        self.names.insert(name.to_string(), Entry::Scalar(idx));
        Ok(())
    }

    fn check_free(&self, name: &str) -> Result<(), ConfigError> {
        if self.names.contains_key(name) {
            return Err(ConfigError::Duplicate {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    pub fn set_scalar(&mut self, name: &str, value: Value) -> Result<(), ConfigError> {
        match self.names.get(name) {
            Some(&Entry::Scalar(idx)) => {
                let scalar = &mut self.scalars[idx];
                if scalar.value.element_type() != value.element_type() {
                    return Err(ConfigError::TypeMismatch {
                        name: name.to_string(),
                        expected: scalar.value.element_type(),
                        found: value.element_type(),
                    });
                }
                scalar.value = value;
                Ok(())
            }
            _ => Err(ConfigError::UnknownVariable {
                name: name.to_string(),
            }),
        }
    }

    pub fn scalar(&self, name: &str) -> Result<Value, ConfigError> {
        match self.names.get(name) {
            Some(&Entry::Scalar(idx)) => Ok(self.scalars[idx].value),
            _ => Err(ConfigError::UnknownVariable {
                name: name.to_string(),
            }),
        }
    }

    fn variable_index(&self, name: &str) -> Result<usize, ConfigError> {
        match self.names.get(name) {
            Some(&Entry::Variable(idx)) => Ok(idx),
            _ => Err(ConfigError::UnknownVariable {
                name: name.to_string(),
            }),
        }
    }

    pub fn handle(&self, name: &str) -> Result<VarId, ConfigError> {
        self.variable_index(name).map(VarId)
    }

    pub fn get(&self, name: &str) -> Result<&Column, ConfigError> {
        Ok(&self.variables[self.variable_index(name)?].column)
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut Column, ConfigError> {
        let idx = self.variable_index(name)?;
        Ok(&mut self.variables[idx].column)
    }

    pub fn column(&self, id: VarId) -> &Column {
        &self.variables[id.0].column
    }

    pub fn owner(&self, name: &str) -> Result<EntitySetId, ConfigError> {
        Ok(self.variables[self.variable_index(name)?].entity)
    }

    pub fn f32s(&self, name: &str) -> Result<&[f32], ConfigError> {
        match self.get(name)? {
            Column::F32(v) => Ok(v),
            other => Err(type_mismatch(name, ElementType::F32, other)),
        }
    }

    pub fn f32s_mut(&mut self, name: &str) -> Result<&mut [f32], ConfigError> {
        match self.get_mut(name)? {
            Column::F32(v) => Ok(v),
            other => Err(type_mismatch(name, ElementType::F32, other)),
        }
    }

    pub fn i32s(&self, name: &str) -> Result<&[i32], ConfigError> {
        match self.get(name)? {
            Column::I32(v) => Ok(v),
            other => Err(type_mismatch(name, ElementType::I32, other)),
        }
    }

    pub fn bools(&self, name: &str) -> Result<&[bool], ConfigError> {
        match self.get(name)? {
            Column::Bool(v) => Ok(v),
            other => Err(type_mismatch(name, ElementType::Bool, other)),
        }
    }

    pub fn bools_mut(&mut self, name: &str) -> Result<&mut [bool], ConfigError> {
        match self.get_mut(name)? {
            Column::Bool(v) => Ok(v),
            other => Err(type_mismatch(name, ElementType::Bool, other)),
        }
    }

    /// Extend one array to `new_length`, zero-filling new slots.
    pub fn grow(&mut self, name: &str, new_length: usize) -> Result<()> {
        let idx = self.variable_index(name)?;
        let var = &mut self.variables[idx];
        let current = var.column.len();
        if new_length < current {
            return Err(ConfigError::Shrink {
                name: name.to_string(),
                current,
                requested: new_length,
            }
            .into());
        }
        var.column
            .try_grow(new_length)
            .map_err(|_| ResourceError::Allocation {
                name: name.to_string(),
                requested: new_length,
            })?;
        Ok(())
    }

    /// Fill with `start, start + 1, ...` (numeric arrays only).
    pub fn fill_arange(&mut self, name: &str, start: i32) -> Result<(), ConfigError> {
        match self.get_mut(name)? {
            Column::F32(v) => v
                .iter_mut()
                .enumerate()
                .for_each(|(i, x)| *x = start as f32 + i as f32),
            Column::I32(v) => v
                .iter_mut()
                .enumerate()
                .for_each(|(i, x)| *x = start + i as i32),
            other => return Err(type_mismatch(name, ElementType::I32, other)),
        }
        Ok(())
    }

    /// Replace the whole array with `values`, which must match in type and length.
    pub fn set_values(&mut self, name: &str, values: &Column) -> Result<(), ConfigError> {
        let column = self.get_mut(name)?;
        if column.element_type() != values.element_type() {
            return Err(ConfigError::TypeMismatch {
                name: name.to_string(),
                expected: column.element_type(),
                found: values.element_type(),
            });
        }
        if column.len() != values.len() {
            return Err(ConfigError::LengthMismatch {
                name: name.to_string(),
                expected: column.len(),
                found: values.len(),
            });
        }
        *column = values.clone();
        Ok(())
    }

    /// Write `values[k]` to element `indices[k]`. Nothing is written unless
    /// every index is in range.
    pub fn set_at(
        &mut self,
        name: &str,
        indices: &[usize],
        values: &Column,
    ) -> Result<(), ConfigError> {
        let column = self.get_mut(name)?;
        if column.element_type() != values.element_type() {
            return Err(ConfigError::TypeMismatch {
                name: name.to_string(),
                expected: column.element_type(),
                found: values.element_type(),
            });
        }
        if indices.len() != values.len() {
            return Err(ConfigError::LengthMismatch {
                name: name.to_string(),
                expected: indices.len(),
                found: values.len(),
            });
        }
        let count = column.len();
        if let Some(&index) = indices.iter().find(|&&i| i >= count) {
            return Err(ConfigError::IndexOutOfRange {
                name: name.to_string(),
                index,
                count,
            });
        }
        for (k, &i) in indices.iter().enumerate() {
            if let Some(value) = values.get(k) {
                column.set(i, value);
            }
        }
        Ok(())
    }

    /// Set every element to `value`.
    pub fn fill(&mut self, name: &str, value: Value) -> Result<(), ConfigError> {
        let column = self.get_mut(name)?;
        if column.element_type() != value.element_type() {
            return Err(ConfigError::TypeMismatch {
                name: name.to_string(),
                expected: column.element_type(),
                found: value.element_type(),
            });
        }
        for i in 0..column.len() {
            column.set(i, value);
        }
        Ok(())
    }

    /// Return to the freshly declared state: neuron arrays zero-filled,
    /// synapse groups emptied, scalars back to their declared values.
    pub fn zero_all(&mut self) {
        for (idx, set) in self.entity_sets.iter_mut().enumerate() {
            if matches!(set.kind, EntityKind::Synapses { .. }) {
                set.count = 0;
                if let Some(conn) = self.connectivity.get_mut(&EntitySetId(idx)) {
                    conn.clear();
                }
            }
        }
        for var in &mut self.variables {
            let count = self.entity_sets[var.entity.0].count;
            var.column.truncate(count);
            var.column.zero_fill();
        }
        for scalar in &mut self.scalars {
            scalar.value = scalar.declared;
        }
    }

    // =========================================================================
    // Lane access (crate-internal)
    // =========================================================================

    pub(crate) fn lookup(&self, name: &str) -> Option<Entry> {
        self.names.get(name).copied()
    }

    pub(crate) fn entry_type(&self, entry: Entry) -> ElementType {
        match entry {
            Entry::Variable(idx) => self.variables[idx].column.element_type(),
            Entry::Scalar(idx) => self.scalars[idx].value.element_type(),
        }
    }

    pub(crate) fn entry_len(&self, entry: Entry) -> usize {
        match entry {
            Entry::Variable(idx) => self.variables[idx].column.len(),
            Entry::Scalar(_) => 1,
        }
    }

    #[inline]
    pub(crate) fn read(&self, entry: Entry, i: usize) -> Value {
        match entry {
            Entry::Variable(idx) => match &self.variables[idx].column {
                Column::F32(v) => Value::F32(v[i]),
                Column::I32(v) => Value::I32(v[i]),
                Column::Bool(v) => Value::Bool(v[i]),
            },
            Entry::Scalar(idx) => self.scalars[idx].value,
        }
    }

    #[inline]
    pub(crate) fn write(&mut self, entry: Entry, i: usize, value: Value) {
        if let Entry::Variable(idx) = entry {
            let stored = self.variables[idx].column.set(i, value);
            debug_assert!(stored, "lane wrote a value of the wrong type");
        }
    }
}

fn type_mismatch(name: &str, expected: ElementType, found: &Column) -> ConfigError {
    ConfigError::TypeMismatch {
        name: name.to_string(),
        expected,
        found: found.element_type(),
    }
}
