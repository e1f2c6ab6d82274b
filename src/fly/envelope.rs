//! Character budgeting for auxiliary prompt context and retained tool output.

use serde::{Deserialize, Serialize};

use crate::protocol::{ArtifactMeta, FlyRole};

const CLIP_MARKER: &str = "\n... (clipped)";

/// One bounded context section of a prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSlice {
    pub name: String,
    pub source_ref: String,
    pub original_chars: usize,
    pub used_chars: usize,
    pub truncated: bool,
    /// Text actually included; not written to the protocol trail
    #[serde(skip)]
    pub text: Option<String>,
}

/// Budget report for the context injected into one agent turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEnvelope {
    #[serde(flatten)]
    pub meta: ArtifactMeta,
    pub prompt_budget_chars: usize,
    pub tool_output_budget_chars: usize,
    pub slices: Vec<ContextSlice>,
    pub overflowed: bool,
}

impl ContextEnvelope {
    pub fn slice(&self, name: &str) -> Option<&ContextSlice> {
        self.slices.iter().find(|s| s.name == name)
    }

    /// Included text of a slice, if any survived the budget
    pub fn text_of(&self, name: &str) -> Option<&str> {
        self.slice(name).and_then(|s| s.text.as_deref())
    }

    pub fn used_chars(&self) -> usize {
        self.slices.iter().map(|s| s.used_chars).sum()
    }
}

pub const DIRECTORY_POLICY_SLICE: &str = "directory_policy_context";
pub const WAYPOINT_MEMORY_SLICE: &str = "waypoint_memory_context";

/// Fit the policy and memory sections into `prompt_budget_chars`, in that order.
///
/// Budgets below zero count as zero. Sizes are in chars, not bytes.
pub fn apply_context_envelope(
    waypoint_id: &str,
    role: FlyRole,
    prompt_budget_chars: i64,
    tool_output_budget_chars: i64,
    directory_policy_context: Option<&str>,
    waypoint_memory_context: Option<&str>,
) -> ContextEnvelope {
    let prompt_budget = prompt_budget_chars.max(0) as usize;
    let mut remaining = prompt_budget;

    let sections = [
        (DIRECTORY_POLICY_SLICE, "project-memory-index", directory_policy_context),
        (WAYPOINT_MEMORY_SLICE, "waypoint-memory-index", waypoint_memory_context),
    ];
    let slices: Vec<ContextSlice> = sections
        .into_iter()
        .map(|(name, source_ref, text)| clip_slice(name, source_ref, text, &mut remaining))
        .collect();

    let overflowed = slices.iter().any(|s| s.truncated);
    let source_refs = slices.iter().map(|s| s.source_ref.clone()).collect();

    ContextEnvelope {
        meta: ArtifactMeta::new("context_envelope", waypoint_id, role).with_source_refs(source_refs),
        prompt_budget_chars: prompt_budget,
        tool_output_budget_chars: tool_output_budget_chars.max(0) as usize,
        slices,
        overflowed,
    }
}

fn clip_slice(name: &str, source_ref: &str, text: Option<&str>, remaining: &mut usize) -> ContextSlice {
    let source = text.unwrap_or("");
    let original_chars = source.chars().count();
    let mut slice = ContextSlice {
        name: name.to_string(),
        source_ref: source_ref.to_string(),
        original_chars,
        used_chars: 0,
        truncated: false,
        text: None,
    };

    if source.is_empty() {
        return slice;
    }
    if *remaining == 0 {
        slice.truncated = true;
        return slice;
    }
    if original_chars <= *remaining {
        *remaining -= original_chars;
        slice.used_chars = original_chars;
        slice.text = Some(source.to_string());
        return slice;
    }

    slice.used_chars = *remaining;
    slice.truncated = true;
    slice.text = Some(source.chars().take(*remaining).collect());
    *remaining = 0;
    slice
}

/// Bound tool output kept in loop state for later reinjection.
///
/// The result is never longer than `max_chars`.
pub fn clip_tool_output_for_context(output: Option<&str>, max_chars: i64) -> Option<String> {
    let output = output?;
    if max_chars <= 0 {
        return None;
    }
    let max_chars = max_chars as usize;
    let len = output.chars().count();
    if len <= max_chars {
        return Some(output.to_string());
    }

    let marker_len = CLIP_MARKER.chars().count();
    if max_chars <= marker_len {
        return Some(output.chars().take(max_chars).collect());
    }
    let mut clipped: String = output.chars().take(max_chars - marker_len).collect();
    clipped.push_str(CLIP_MARKER);
    Some(clipped)
}
