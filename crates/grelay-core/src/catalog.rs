//! The model catalogue: a hard-coded base set plus synthesised
//! `-search` / `-nothinking` / `-maxthinking` variants, and the thinking
//! budget policy for each of them.

use grelay_protocol::gemini::{GeminiModel, ThinkingConfig};
use grelay_protocol::openai::request::ReasoningEffort;
use grelay_protocol::openai::response::ModelEntry;

/// Stable `created` stamp used by the OpenAI model listing.
const MODEL_CREATED_AT: i64 = 1677610602;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelDescriptor {
    pub name: &'static str,
    pub display_name: &'static str,
    pub description: &'static str,
    pub input_token_limit: u32,
    pub output_token_limit: u32,
    pub supports_thinking: bool,
    pub supports_search: bool,
}

/// Models verified to exist on the CodeAssist endpoint.
pub const BASE_MODELS: [ModelDescriptor; 6] = [
    ModelDescriptor {
        name: "gemini-2.0-flash",
        display_name: "Gemini 2.0 Flash",
        description: "Fast multimodal model from Gemini 2.0 generation",
        input_token_limit: 1_048_576,
        output_token_limit: 8_192,
        supports_thinking: false,
        supports_search: true,
    },
    ModelDescriptor {
        name: "gemini-2.5-flash",
        display_name: "Gemini 2.5 Flash",
        description: "Fast and efficient multimodal model with latest improvements",
        input_token_limit: 1_048_576,
        output_token_limit: 65_535,
        supports_thinking: true,
        supports_search: true,
    },
    ModelDescriptor {
        name: "gemini-2.5-flash-lite",
        display_name: "Gemini 2.5 Flash Lite",
        description: "Lightweight version of Gemini 2.5 Flash, fast and cost-efficient",
        input_token_limit: 1_048_576,
        output_token_limit: 65_535,
        supports_thinking: false,
        supports_search: true,
    },
    ModelDescriptor {
        name: "gemini-2.5-pro",
        display_name: "Gemini 2.5 Pro",
        description: "Advanced multimodal model with enhanced capabilities",
        input_token_limit: 1_048_576,
        output_token_limit: 65_535,
        supports_thinking: true,
        supports_search: true,
    },
    ModelDescriptor {
        name: "gemini-3-flash-preview",
        display_name: "Gemini 3.0 Flash Preview",
        description: "Preview version of Gemini 3.0 Flash, latest generation",
        input_token_limit: 1_048_576,
        output_token_limit: 65_535,
        supports_thinking: true,
        supports_search: true,
    },
    ModelDescriptor {
        name: "gemini-3-pro-preview",
        display_name: "Gemini 3.0 Pro Preview",
        description: "Preview version of Gemini 3.0 Pro, most capable model",
        input_token_limit: 1_048_576,
        output_token_limit: 65_535,
        supports_thinking: true,
        supports_search: true,
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Default,
    Search,
    NoThinking,
    MaxThinking,
}

impl Variant {
    /// Suffix candidates ordered by length, longest first, so that
    /// resolution never chops a shorter suffix out of a longer one.
    const SUFFIXED: [Variant; 3] = [Variant::MaxThinking, Variant::NoThinking, Variant::Search];

    pub fn suffix(&self) -> &'static str {
        match self {
            Variant::Default => "",
            Variant::Search => "-search",
            Variant::NoThinking => "-nothinking",
            Variant::MaxThinking => "-maxthinking",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResolvedModel {
    pub base: &'static ModelDescriptor,
    pub variant: Variant,
}

impl ResolvedModel {
    pub fn is_search(&self) -> bool {
        self.variant == Variant::Search
    }
}

fn find_base(name: &str) -> Option<&'static ModelDescriptor> {
    BASE_MODELS.iter().find(|model| model.name == name)
}

/// Map a published model name back to its base descriptor and variant by
/// stripping the longest matching suffix. Unknown base names fail.
pub fn resolve(name: &str) -> Option<ResolvedModel> {
    let name = name.strip_prefix("models/").unwrap_or(name);
    for variant in Variant::SUFFIXED {
        if let Some(stripped) = name.strip_suffix(variant.suffix()) {
            if let Some(base) = find_base(stripped) {
                return Some(ResolvedModel { base, variant });
            }
        }
    }
    find_base(name).map(|base| ResolvedModel {
        base,
        variant: Variant::Default,
    })
}

pub fn is_search(name: &str) -> bool {
    resolve(name).is_some_and(|resolved| resolved.is_search())
}

/// (disabled, maximum) thinking budgets per base model. A few models
/// refuse a zero budget and want 128 instead.
fn budgets(base: &ModelDescriptor) -> (i64, i64) {
    match base.name {
        "gemini-3-pro-preview" => (128, 45_000),
        "gemini-2.5-pro" => (128, 32_768),
        _ => (0, 24_576),
    }
}

/// Thinking configuration for a resolved model, or `None` when the base
/// model does not support thinking at all (the upstream rejects a
/// `thinkingConfig` on those). A variant suffix always wins over an
/// explicit `reasoning_effort`.
pub fn thinking_for(
    resolved: &ResolvedModel,
    effort: Option<ReasoningEffort>,
) -> Option<ThinkingConfig> {
    if !resolved.base.supports_thinking {
        return None;
    }
    let (disabled, max) = budgets(resolved.base);
    let config = match resolved.variant {
        Variant::NoThinking => ThinkingConfig {
            thinking_budget: disabled,
            include_thoughts: false,
        },
        Variant::MaxThinking => ThinkingConfig {
            thinking_budget: max,
            include_thoughts: true,
        },
        Variant::Default | Variant::Search => {
            let budget = match effort {
                None | Some(ReasoningEffort::Medium) => -1,
                Some(ReasoningEffort::Minimal) => disabled,
                Some(ReasoningEffort::Low) => 1000,
                Some(ReasoningEffort::High) => max,
            };
            ThinkingConfig {
                thinking_budget: budget,
                include_thoughts: true,
            }
        }
    };
    Some(config)
}

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub base: &'static ModelDescriptor,
}

impl CatalogEntry {
    pub fn to_openai(&self) -> ModelEntry {
        ModelEntry {
            id: self.name.clone(),
            object: "model".to_string(),
            created: MODEL_CREATED_AT,
            owned_by: "google".to_string(),
        }
    }

    pub fn to_gemini(&self) -> GeminiModel {
        GeminiModel {
            name: format!("models/{}", self.name),
            version: "001".to_string(),
            display_name: self.display_name.clone(),
            description: self.description.clone(),
            input_token_limit: self.base.input_token_limit,
            output_token_limit: self.base.output_token_limit,
            supported_generation_methods: vec![
                "generateContent".to_string(),
                "streamGenerateContent".to_string(),
            ],
            temperature: 1.0,
            max_temperature: 2.0,
            top_p: 0.95,
            top_k: 64,
        }
    }
}

fn entry(base: &'static ModelDescriptor, variant: Variant) -> CatalogEntry {
    let (display_suffix, description_suffix) = match variant {
        Variant::Default => ("", ""),
        Variant::Search => (" with Google Search", " (includes Google Search grounding)"),
        Variant::NoThinking => (" (No Thinking)", " (thinking disabled)"),
        Variant::MaxThinking => (" (Max Thinking)", " (maximum thinking budget)"),
    };
    CatalogEntry {
        name: format!("{}{}", base.name, variant.suffix()),
        display_name: format!("{}{}", base.display_name, display_suffix),
        description: format!("{}{}", base.description, description_suffix),
        base,
    }
}

/// The published catalogue: base entries plus their variants, sorted by
/// name. Thinking variants exist only for bases that support thinking.
pub fn list_models() -> Vec<CatalogEntry> {
    let mut entries = Vec::new();
    for base in &BASE_MODELS {
        entries.push(entry(base, Variant::Default));
        if base.supports_search {
            entries.push(entry(base, Variant::Search));
        }
        if base.supports_thinking {
            entries.push(entry(base, Variant::NoThinking));
            entries.push(entry(base, Variant::MaxThinking));
        }
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}
