#![forbid(unsafe_code)]

//! Cache keys for compiled artifacts.
//!
//! Two digests live here. [`signature_key`] identifies a call site's input
//! signature before any tracing happens, which is what a front end looks
//! artifacts up by. [`build_cache_key`] additionally folds in the traced
//! graph's fingerprint and the backend identity, and is reported on the
//! artifact for logs and reproducibility.

use af_core::{CompatibilityMode, DType, Graph, StorageId, ValueMeta};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use thiserror::Error;

/// Everything about one argument that a compiled artifact was specialized on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InputSignature {
    Tensor {
        dtype: DType,
        sizes: Vec<usize>,
        strides: Vec<usize>,
        requires_grad: bool,
        /// Subclass kind plus component count, `None` for dense tensors.
        subclass: Option<(String, usize)>,
        /// First earlier position that is the very same view, if any.
        same_view_as: Option<usize>,
        /// First earlier position sharing this argument's storage, if any.
        shares_storage_with: Option<usize>,
    },
    SymInt,
}

impl InputSignature {
    fn write_canonical(&self, out: &mut String) {
        match self {
            Self::SymInt => out.push_str("symint"),
            Self::Tensor {
                dtype,
                sizes,
                strides,
                requires_grad,
                subclass,
                same_view_as,
                shares_storage_with,
            } => {
                let _ = write!(
                    out,
                    "{}:{sizes:?}:{strides:?}:rg={requires_grad}",
                    dtype.as_str()
                );
                match subclass {
                    Some((kind, count)) => {
                        let _ = write!(out, ":{kind}/{count}");
                    }
                    None => out.push_str(":dense"),
                }
                if let Some(pos) = same_view_as {
                    let _ = write!(out, ":dup={pos}");
                }
                if let Some(pos) = shares_storage_with {
                    let _ = write!(out, ":alias={pos}");
                }
            }
        }
    }
}

/// Derive per-position signatures from argument metadata.
#[must_use]
pub fn input_signatures(metas: &[ValueMeta]) -> Vec<InputSignature> {
    let mut seen_storages: Vec<(StorageId, usize)> = Vec::new();
    let mut out = Vec::with_capacity(metas.len());
    for (pos, meta) in metas.iter().enumerate() {
        let Some(tensor) = meta.as_tensor() else {
            out.push(InputSignature::SymInt);
            continue;
        };
        let same_view_as = metas[..pos].iter().position(|earlier| {
            earlier.as_tensor().is_some_and(|e| {
                e.storage == tensor.storage
                    && e.layout == tensor.layout
                    && e.subclass == tensor.subclass
            })
        });
        let shares_storage_with = seen_storages
            .iter()
            .find(|(storage, _)| *storage == tensor.storage)
            .map(|(_, first)| *first);
        if shares_storage_with.is_none() {
            seen_storages.push((tensor.storage, pos));
        }
        out.push(InputSignature::Tensor {
            dtype: tensor.dtype,
            sizes: tensor.layout.sizes.clone(),
            strides: tensor.layout.strides.clone(),
            requires_grad: tensor.requires_grad,
            subclass: tensor
                .subclass
                .as_ref()
                .map(|s| (s.kind.clone(), s.component_count())),
            same_view_as,
            shares_storage_with,
        });
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeyInput {
    pub mode: CompatibilityMode,
    pub backend: String,
    pub backend_version: String,
    pub graph: Graph,
    pub inputs: Vec<InputSignature>,
    pub compile_options: BTreeMap<String, String>,
    pub unknown_incompatible_features: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub namespace: String,
    pub digest_hex: String,
}

impl CacheKey {
    #[must_use]
    pub fn as_string(&self) -> String {
        format!("{}-{}", self.namespace, self.digest_hex)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.namespace, self.digest_hex)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheKeyError {
    #[error("strict mode rejected unknown incompatible features: {}", features.join(","))]
    UnknownIncompatibleFeatures { features: Vec<String> },
}

pub fn build_cache_key(input: &CacheKeyInput) -> Result<CacheKey, CacheKeyError> {
    if input.mode == CompatibilityMode::Strict && !input.unknown_incompatible_features.is_empty() {
        return Err(CacheKeyError::UnknownIncompatibleFeatures {
            features: input.unknown_incompatible_features.clone(),
        });
    }

    Ok(CacheKey {
        namespace: "afx".to_owned(),
        digest_hex: sha256_hex(canonical_payload(input).as_bytes()),
    })
}

/// Lookup key for a call site: input signatures plus the options that change
/// what gets compiled. Independent of tracing.
#[must_use]
pub fn signature_key(
    inputs: &[InputSignature],
    compile_options: &BTreeMap<String, String>,
) -> CacheKey {
    let mut payload = String::from("sig|");
    write_inputs(&mut payload, inputs);
    payload.push('|');
    write_options(&mut payload, compile_options);
    CacheKey {
        namespace: "afs".to_owned(),
        digest_hex: sha256_hex(payload.as_bytes()),
    }
}

#[must_use]
pub fn compatibility_matrix_row(input: &CacheKeyInput) -> String {
    format!(
        "mode={:?},backend={},unknown_features={}",
        input.mode,
        input.backend,
        input.unknown_incompatible_features.join(";")
    )
}

fn canonical_payload(input: &CacheKeyInput) -> String {
    let mut out = format!(
        "mode={:?}|backend={}@{}|inputs=",
        input.mode, input.backend, input.backend_version
    );
    write_inputs(&mut out, &input.inputs);
    out.push_str("|options=");
    write_options(&mut out, &input.compile_options);
    out.push_str("|unknown=");
    out.push_str(&input.unknown_incompatible_features.join(","));
    out.push_str("|graph=");
    out.push_str(input.graph.canonical_fingerprint());
    out
}

fn write_inputs(out: &mut String, inputs: &[InputSignature]) {
    for (pos, sig) in inputs.iter().enumerate() {
        let _ = write!(out, "{pos}:");
        sig.write_canonical(out);
        out.push(';');
    }
}

fn write_options(out: &mut String, options: &BTreeMap<String, String>) {
    for (key, value) in options {
        let _ = write!(out, "{key}={value};");
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}
