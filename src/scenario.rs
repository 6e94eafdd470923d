use serde::{Deserialize, Serialize};

use crate::formats::Focus;

pub const MAX_TOKENS_CAP: u32 = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    Outline,
    Writing,
    Polish,
    Draft,
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelParams {
    pub temperature: f32,
    pub top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub enable_thinking: bool,
    pub enable_search: bool,
}

impl Scenario {
    pub fn params(self) -> ModelParams {
        let (temperature, top_p, max_tokens, enable_thinking, enable_search) = match self {
            Self::Outline => (0.6, 0.9, Some(8192), false, true),
            Self::Writing => (0.75, 0.9, Some(8192), true, true),
            Self::Polish => (0.65, 0.85, Some(8192), true, false),
            Self::Draft => (0.65, 0.9, Some(8192), true, true),
            Self::Default => (0.7, 0.9, None, false, false),
        };
        ModelParams {
            temperature,
            top_p,
            max_tokens,
            enable_thinking,
            enable_search,
        }
    }
}

impl ModelParams {
    /// Applies caller overrides; `max_tokens` never exceeds [`MAX_TOKENS_CAP`].
    pub fn with_overrides(
        mut self,
        temperature: Option<f32>,
        top_p: Option<f32>,
        max_tokens: Option<u32>,
    ) -> Self {
        if let Some(temperature) = temperature {
            self.temperature = temperature.clamp(0.0, 2.0);
        }
        if let Some(top_p) = top_p {
            self.top_p = top_p.clamp(0.0, 1.0);
        }
        if let Some(max_tokens) = max_tokens {
            self.max_tokens = Some(max_tokens);
        }
        self.max_tokens = self.max_tokens.map(|n| n.min(MAX_TOKENS_CAP));
        self
    }
}

/// What is known about a request before it is sent.
#[derive(Debug, Clone)]
pub struct ScenarioContext<'a> {
    pub explicit: Option<Scenario>,
    pub focus: &'a Focus,
    pub has_outline: bool,
    pub already_written: bool,
    pub query: &'a str,
    pub system_prompt: &'a str,
}

const POLISH_KEYWORDS: [&str; 5] = ["润色", "优化", "polish", "refine", "改进"];
const DRAFT_KEYWORDS: [&str; 3] = ["生成初稿", "draft", "自动生成"];
const RENAME_KEYWORDS: [&str; 5] = ["标题", "修改标题", "重命名", "改成", "改为"];
const REGENERATE_KEYWORDS: [&str; 4] = ["重新生成", "重写", "重新大纲", "重排"];

pub fn detect(ctx: &ScenarioContext<'_>) -> Scenario {
    if let Some(explicit) = ctx.explicit {
        return explicit;
    }

    let text = format!("{}{}", ctx.system_prompt, ctx.query).to_lowercase();
    let mentions = |keywords: &[&str]| keywords.iter().any(|k| text.contains(k));

    if mentions(&POLISH_KEYWORDS) {
        return Scenario::Polish;
    }
    if mentions(&DRAFT_KEYWORDS) {
        return Scenario::Draft;
    }
    if mentions(&RENAME_KEYWORDS) {
        return Scenario::Writing;
    }

    match ctx.focus {
        Focus::Local(_) => Scenario::Writing,
        Focus::Global => {
            if !ctx.has_outline && !ctx.already_written {
                return Scenario::Outline;
            }
            if text.contains("大纲") {
                return if mentions(&REGENERATE_KEYWORDS) {
                    Scenario::Outline
                } else {
                    Scenario::Writing
                };
            }
            if ctx.already_written {
                Scenario::Polish
            } else {
                Scenario::Writing
            }
        }
    }
}

/// Size class of a document by its total word budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentScale {
    Small,
    Medium,
    Large,
    ExtraLarge,
}

impl DocumentScale {
    pub fn from_total_words(total: u64) -> Self {
        match total {
            100_000.. => Self::ExtraLarge,
            50_000.. => Self::Large,
            10_000.. => Self::Medium,
            _ => Self::Small,
        }
    }

    pub fn max_depth(self) -> usize {
        match self {
            Self::Small => 2,
            Self::Medium => 3,
            Self::Large | Self::ExtraLarge => 4,
        }
    }
}
