//! Generation provenance: the key/value context handed over by the host and
//! the serialized record embedded into saved files.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROMPT_KEY: &str = "prompt";
pub const NEGATIVE_PROMPT_KEY: &str = "negative_prompt";
pub const SEED_KEY: &str = "seed";
pub const MODEL_KEY: &str = "model";
pub const STEPS_KEY: &str = "steps";
pub const CFG_KEY: &str = "cfg";
pub const SAMPLER_KEY: &str = "sampler";
pub const SCHEDULER_KEY: &str = "scheduler";
pub const WIDTH_KEY: &str = "width";
pub const HEIGHT_KEY: &str = "height";
pub const WORKFLOW_KEY: &str = "workflow";

const CHECKPOINT_NODES: &[&str] = &["CheckpointLoaderSimple", "CheckpointLoader", "CheckpointLoaderV2"];
const SAMPLER_NODES: &[&str] = &[
    "KSampler",
    "KSamplerAdvanced",
    "SamplerCustom",
    "SamplerCustomAdvanced",
];
const TEXT_NODES: &[&str] = &["CLIPTextEncode", "CLIPTextEncodeSDXL", "T5TextEncode"];

/// Parameters describing how one image was generated.
///
/// Keys are kept sorted so the serialized record is stable for equal contexts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProvenanceContext(BTreeMap<String, Value>);

impl ProvenanceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn prompt(&self) -> Option<&str> {
        self.get(PROMPT_KEY).and_then(Value::as_str)
    }

    pub fn seed(&self) -> Option<&Value> {
        self.get(SEED_KEY).filter(|v| !v.is_null())
    }

    pub fn model(&self) -> Option<&str> {
        self.get(MODEL_KEY).and_then(Value::as_str)
    }

    /// Fills keys that are still missing from a host prompt graph.
    ///
    /// Accepts both the API form (`{"<id>": {"class_type", "inputs"}}`) and the
    /// editor form (`{"nodes": [...]}`). Existing keys are never overwritten.
    /// Text-encode nodes are taken in node order: the first one is the
    /// positive prompt, the second the negative prompt.
    pub fn fill_from_graph(&mut self, graph: &Value) {
        let mut nodes: Vec<(Option<u64>, String, &Value)> = match graph {
            Value::Object(map) => match map.get("nodes") {
                Some(Value::Array(list)) => list
                    .iter()
                    .enumerate()
                    .map(|(i, node)| (Some(i as u64), i.to_string(), node))
                    .collect(),
                _ => map
                    .iter()
                    .map(|(id, node)| (id.parse::<u64>().ok(), id.clone(), node))
                    .collect(),
            },
            Value::Array(list) => list
                .iter()
                .enumerate()
                .map(|(i, node)| (Some(i as u64), i.to_string(), node))
                .collect(),
            _ => return,
        };
        // Numeric ids first, in numeric order, so "10" sorts after "9".
        nodes.sort_by(|a, b| match (a.0, b.0) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.1.cmp(&b.1),
        });

        let mut prompts = Vec::new();
        for (_, _, node) in nodes {
            let Some(class_type) = node.get("class_type").and_then(Value::as_str) else {
                continue;
            };
            let Some(inputs) = node.get("inputs").and_then(Value::as_object) else {
                continue;
            };

            if CHECKPOINT_NODES.contains(&class_type) {
                self.fill_scalar(MODEL_KEY, inputs.get("ckpt_name"));
            } else if SAMPLER_NODES.contains(&class_type) {
                self.fill_scalar(SEED_KEY, inputs.get("seed").or_else(|| inputs.get("noise_seed")));
                self.fill_scalar(STEPS_KEY, inputs.get("steps"));
                self.fill_scalar(CFG_KEY, inputs.get("cfg"));
                self.fill_scalar(SAMPLER_KEY, inputs.get("sampler_name"));
                self.fill_scalar(SCHEDULER_KEY, inputs.get("scheduler"));
            } else if TEXT_NODES.contains(&class_type) {
                if let Some(text) = inputs.get("text").and_then(Value::as_str) {
                    let text = text.trim();
                    if !text.is_empty() {
                        prompts.push(text.to_string());
                    }
                }
            }
        }

        let mut prompts = prompts.into_iter();
        self.fill_scalar(PROMPT_KEY, prompts.next().map(Value::String).as_ref());
        self.fill_scalar(NEGATIVE_PROMPT_KEY, prompts.next().map(Value::String).as_ref());
    }

    // Linked inputs show up as `[node_id, slot]` arrays; only literal values count.
    fn fill_scalar(&mut self, key: &str, value: Option<&Value>) {
        let Some(value) = value else { return };
        if !(value.is_string() || value.is_number() || value.is_boolean()) {
            return;
        }
        if self.get(key).map_or(true, Value::is_null) {
            self.0.insert(key.to_string(), value.clone());
        }
    }

    /// Human-readable parameter block in the layout most image viewers and
    /// generation front-ends understand.
    pub fn parameters_text(&self) -> String {
        let mut parts = Vec::new();

        if let Some(prompt) = self.prompt().filter(|p| !p.is_empty()) {
            parts.push(prompt.to_string());
        }
        if let Some(negative) = self
            .get(NEGATIVE_PROMPT_KEY)
            .and_then(Value::as_str)
            .filter(|p| !p.is_empty())
        {
            parts.push(format!("Negative prompt: {}", negative));
        }

        let mut params = Vec::new();
        if let Some(steps) = self.scalar_text(STEPS_KEY) {
            params.push(format!("Steps: {}", steps));
        }
        if let Some(sampler) = self.scalar_text(SAMPLER_KEY) {
            match self.scalar_text(SCHEDULER_KEY) {
                Some(scheduler) if scheduler != "normal" => {
                    params.push(format!("Sampler: {} {}", sampler, scheduler))
                }
                _ => params.push(format!("Sampler: {}", sampler)),
            }
        }
        if let Some(cfg) = self.scalar_text(CFG_KEY) {
            params.push(format!("CFG scale: {}", cfg));
        }
        if let Some(seed) = self.scalar_text(SEED_KEY) {
            params.push(format!("Seed: {}", seed));
        }
        if let (Some(w), Some(h)) = (self.scalar_text(WIDTH_KEY), self.scalar_text(HEIGHT_KEY)) {
            params.push(format!("Size: {}x{}", w, h));
        }
        if let Some(model) = self.model() {
            params.push(format!("Model: {}", short_model_name(model)));
        }
        if !params.is_empty() {
            parts.push(params.join(", "));
        }

        parts.join("\n")
    }

    fn scalar_text(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

/// Model file name without directories or extension.
pub fn short_model_name(model: &str) -> &str {
    let base = model.rsplit(['/', '\\']).next().unwrap_or(model);
    match base.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => base,
    }
}

/// Serialized provenance as embedded in a saved file: compact JSON with
/// sorted keys. The text is carried verbatim, so extraction returns exactly
/// the bytes that were embedded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvenanceRecord(String);

impl ProvenanceRecord {
    pub fn from_context(context: &ProvenanceContext) -> serde_json::Result<Self> {
        serde_json::to_string(context).map(Self)
    }

    /// Wraps already serialized text, as read back from a file.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn to_context(&self) -> serde_json::Result<ProvenanceContext> {
        serde_json::from_str(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
