//! JSON descriptions of workloads and mappings.

use crate::common::{LayerDim, LayerOperand, MemoryOperand, OaDim};
use crate::loma::ordering::TemporalOrdering;
use crate::mapping::spatial::{SpatialMapping, SpatialMappingHint};
use crate::workload::equation::DimRelation;
use crate::workload::graph::{Workload, WorkloadNode};
use crate::workload::layer::{LayerAttributes, LayerNode};
use crate::workload::WorkloadError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// The size of one loop of a user temporal ordering: a number, or `"all"` (also written
/// `null`) for whatever is left of the dimension.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum OrderingFactor {
    Size(u64),
    Word(String),
}

/// Mapping directives for one layer. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct MappingEntry {
    #[serde(default)]
    pub core_allocation: Option<Vec<usize>>,
    #[serde(default)]
    pub spatial_mapping: Option<IndexMap<OaDim, IndexMap<String, f64>>>,
    #[serde(default)]
    pub spatial_mapping_hint: Option<IndexMap<OaDim, Vec<String>>>,
    #[serde(default)]
    pub temporal_ordering: Option<Vec<(String, Option<OrderingFactor>)>>,
    #[serde(default)]
    pub memory_operand_links: Option<IndexMap<String, MemoryOperand>>,
}

impl MappingEntry {
    /// Fills every field this entry lacks from `fallback`.
    fn or(mut self, fallback: Option<&MappingEntry>) -> MappingEntry {
        let Some(fb) = fallback else {
            return self;
        };
        self.core_allocation = self.core_allocation.or_else(|| fb.core_allocation.clone());
        self.spatial_mapping = self.spatial_mapping.or_else(|| fb.spatial_mapping.clone());
        self.spatial_mapping_hint = self
            .spatial_mapping_hint
            .or_else(|| fb.spatial_mapping_hint.clone());
        self.temporal_ordering = self
            .temporal_ordering
            .or_else(|| fb.temporal_ordering.clone());
        self.memory_operand_links = self
            .memory_operand_links
            .or_else(|| fb.memory_operand_links.clone());
        self
    }

    fn apply(self, layer: &str, attrs: &mut LayerAttributes) -> Result<(), WorkloadError> {
        if let Some(cores) = self.core_allocation {
            attrs.core_allocation = cores;
        }
        if let Some(sm) = self.spatial_mapping {
            attrs.spatial_mapping = Some(SpatialMapping::new(
                sm.into_iter()
                    .map(|(oa, m)| {
                        (
                            oa,
                            m.into_iter()
                                .map(|(d, f)| (LayerDim::new(&d), f))
                                .collect(),
                        )
                    })
                    .collect(),
            ));
        }
        if let Some(hint) = self.spatial_mapping_hint {
            attrs.spatial_mapping_hint = SpatialMappingHint::new(
                hint.into_iter()
                    .map(|(oa, dims)| (oa, dims.iter().map(|d| LayerDim::new(d)).collect()))
                    .collect(),
            );
        }
        if let Some(ordering) = self.temporal_ordering {
            let mut entries = Vec::with_capacity(ordering.len());
            for (dim, factor) in ordering {
                let size = match factor {
                    None => None,
                    Some(OrderingFactor::Size(s)) => Some(s),
                    Some(OrderingFactor::Word(w)) if w.eq_ignore_ascii_case("all") => None,
                    Some(OrderingFactor::Word(w)) => {
                        return Err(WorkloadError::InvalidTemporalOrdering {
                            layer: layer.to_owned(),
                            word: w,
                        })
                    }
                };
                entries.push((LayerDim::new(&dim), size));
            }
            attrs.temporal_ordering = TemporalOrdering::new(entries);
        }
        if let Some(links) = self.memory_operand_links {
            attrs.memory_operand_links = links
                .into_iter()
                .map(|(op, m)| (LayerOperand::new(&op), m))
                .collect();
        }
        Ok(())
    }
}

/// Mapping directives keyed by layer name, operator type, or `default`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct MappingDescriptor(IndexMap<String, MappingEntry>);

impl MappingDescriptor {
    pub const DEFAULT_KEY: &'static str = "default";

    pub fn new(entries: IndexMap<String, MappingEntry>) -> Self {
        MappingDescriptor(entries)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, WorkloadError> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    /// The entry for a layer: by name, then by operator type, then the default.
    pub fn lookup(&self, name: &str, operator_type: Option<&str>) -> Option<&MappingEntry> {
        self.0
            .get(name)
            .or_else(|| operator_type.and_then(|t| self.0.get(t)))
            .or_else(|| self.0.get(Self::DEFAULT_KEY))
    }
}

/// One node of a workload file. A node without an equation is a dummy node that only passes
/// data on.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LayerDescriptor {
    pub id: usize,
    pub name: String,
    #[serde(default)]
    pub operator_type: Option<String>,
    #[serde(default)]
    pub equation: Option<String>,
    #[serde(default)]
    pub dimension_relations: Vec<String>,
    #[serde(default)]
    pub loop_dim_size: IndexMap<String, u64>,
    #[serde(default)]
    pub operand_precision: IndexMap<String, u32>,
    #[serde(default)]
    pub operand_source: IndexMap<String, Vec<usize>>,
    #[serde(default)]
    pub constant_operands: Vec<String>,
    #[serde(default)]
    pub padding: IndexMap<String, (u64, u64)>,
    #[serde(default)]
    pub pr_loop_dim_size: IndexMap<String, u64>,
    #[serde(flatten)]
    pub mapping: MappingEntry,
}

impl LayerDescriptor {
    fn into_node(self, mapping: Option<&MappingDescriptor>) -> Result<WorkloadNode, WorkloadError> {
        let Some(equation) = &self.equation else {
            return Ok(WorkloadNode::Dummy {
                id: self.id,
                name: self.name,
                sources: self.operand_source.into_values().flatten().collect(),
            });
        };
        let layer_err = |source| WorkloadError::Equation {
            layer: self.name.clone(),
            source,
        };
        let mut attrs = LayerAttributes {
            operator_type: self.operator_type.clone(),
            equation: Some(equation.parse().map_err(layer_err)?),
            dimension_relations: self
                .dimension_relations
                .iter()
                .map(|r| r.parse::<DimRelation>())
                .collect::<Result<_, _>>()
                .map_err(layer_err)?,
            loop_dim_size: dims(&self.loop_dim_size),
            operand_precision: operands(&self.operand_precision),
            constant_operands: self
                .constant_operands
                .iter()
                .map(|o| LayerOperand::new(o))
                .collect(),
            operand_source: operands(&self.operand_source),
            padding: dims(&self.padding),
            pr_loop_dim_size: dims(&self.pr_loop_dim_size),
            ..Default::default()
        };
        let fallback =
            mapping.and_then(|m| m.lookup(&self.name, self.operator_type.as_deref()));
        self.mapping.or(fallback).apply(&self.name, &mut attrs)?;
        Ok(WorkloadNode::Layer(Arc::new(LayerNode::new(
            self.id, &self.name, attrs,
        )?)))
    }
}

fn dims<T: Clone>(m: &IndexMap<String, T>) -> IndexMap<LayerDim, T> {
    m.iter().map(|(d, v)| (LayerDim::new(d), v.clone())).collect()
}

fn operands<T: Clone>(m: &IndexMap<String, T>) -> IndexMap<LayerOperand, T> {
    m.iter()
        .map(|(o, v)| (LayerOperand::new(o), v.clone()))
        .collect()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(transparent)]
pub struct WorkloadDescriptor(pub Vec<LayerDescriptor>);

impl WorkloadDescriptor {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, WorkloadError> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    /// Builds the workload graph. Directives given on a layer itself take precedence over
    /// those from `mapping`.
    pub fn build(self, mapping: Option<&MappingDescriptor>) -> Result<Workload, WorkloadError> {
        let nodes = self
            .0
            .into_iter()
            .map(|l| l.into_node(mapping))
            .collect::<Result<Vec<_>, _>>()?;
        Workload::new(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORKLOAD: &str = r#"[
        {
            "id": 0, "name": "conv1", "operator_type": "Conv",
            "equation": "O[b][k][oy][ox]+=W[k][c][fy][fx]*I[b][c][iy][ix]",
            "dimension_relations": ["ix=2*ox+1*fx", "iy=2*oy+1*fy"],
            "loop_dim_size": {"B": 1, "K": 64, "C": 3, "OY": 112, "OX": 112, "FY": 7, "FX": 7},
            "operand_precision": {"O": 16, "O_final": 8, "W": 8, "I": 8},
            "operand_source": {"I": []},
            "constant_operands": ["I", "W"],
            "padding": {"IY": [3, 2], "IX": [3, 2]}
        },
        {"id": 1, "name": "flatten", "operand_source": {"I": [0]}},
        {
            "id": 2, "name": "fc", "operator_type": "Gemm",
            "equation": "O[b][k]+=W[k][c]*I[b][c]",
            "loop_dim_size": {"B": 1, "K": 10, "C": 64},
            "operand_precision": {"O": 16, "O_final": 8, "W": 8, "I": 8},
            "operand_source": {"I": [1]},
            "constant_operands": ["W"],
            "temporal_ordering": [["C", 8], ["k", "all"], ["*", null]]
        }
    ]"#;

    const MAPPING: &str = r#"{
        "conv1": {"spatial_mapping": {"D1": {"K": 16}, "D2": {"C": 3}}},
        "Gemm": {"core_allocation": [1]},
        "default": {
            "core_allocation": [0],
            "spatial_mapping_hint": {"D1": ["K"], "D2": ["C", "ox"]},
            "memory_operand_links": {"O": "O", "W": "I2", "I": "I1"}
        }
    }"#;

    #[test]
    fn test_build_workload_with_mapping() {
        let w: WorkloadDescriptor = serde_json::from_str(WORKLOAD).unwrap();
        let m: MappingDescriptor = serde_json::from_str(MAPPING).unwrap();
        let workload = w.build(Some(&m)).unwrap();
        assert_eq!(workload.len(), 3);
        let layers = workload.layers();
        assert_eq!(layers.len(), 2);

        let conv = &layers[0];
        assert_eq!(conv.pr_layer_dim_sizes[&LayerDim::new("IX")], 224);
        assert_eq!(
            conv.spatial_mapping.as_ref().unwrap().utilization(&OaDim::new("D1")),
            16.0
        );
        // The layer name matched, so neither the hint nor the links of the default entry apply.
        assert!(conv.spatial_mapping_hint.is_empty());
        assert_eq!(conv.core_allocation, [0]);

        let fc = &layers[1];
        assert_eq!(fc.core_allocation, [1]);
        assert_eq!(
            fc.temporal_ordering.entries(),
            &[
                (LayerDim::new("C"), Some(8)),
                (LayerDim::new("K"), None),
                (LayerDim::new("*"), None)
            ]
        );
    }

    #[test]
    fn test_default_mapping_entry() {
        let m: MappingDescriptor = serde_json::from_str(MAPPING).unwrap();
        let entry = m.lookup("pool", Some("Pool")).unwrap();
        let hint = entry.spatial_mapping_hint.as_ref().unwrap();
        assert_eq!(hint[&OaDim::new("D2")], ["C", "ox"]);
    }

    #[test]
    fn test_bad_ordering_word() {
        let text = WORKLOAD.replace(r#"["k", "all"]"#, r#"["k", "most"]"#);
        let w: WorkloadDescriptor = serde_json::from_str(&text).unwrap();
        assert!(matches!(
            w.build(None),
            Err(WorkloadError::InvalidTemporalOrdering { .. })
        ));
    }

    #[test]
    fn test_bad_equation_names_layer() {
        let text = WORKLOAD.replace("O[b][k]+=W[k][c]*I[b][c]", "O[b][k]+=");
        let w: WorkloadDescriptor = serde_json::from_str(&text).unwrap();
        match w.build(None) {
            Err(WorkloadError::Equation { layer, .. }) => assert_eq!(layer, "fc"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
