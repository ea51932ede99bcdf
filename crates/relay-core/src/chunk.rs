use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One chunk of an OpenAI-compatible streaming chat completion.
///
/// Only the parts the translator reads are modelled; everything else in the
/// upstream payload is ignored. A chunk may instead carry a fully built event
/// under `event`, which is passed through as-is.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: ChunkDelta,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallFragment>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallFragment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionFragment>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionFragment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

impl ChatCompletionChunk {
    pub fn text(content: &str) -> Self {
        Self::from_delta(ChunkDelta {
            content: Some(content.to_string()),
            tool_calls: None,
        })
    }

    pub fn tool_call(id: Option<&str>, name: Option<&str>, arguments: Option<&str>) -> Self {
        Self::from_delta(ChunkDelta {
            content: None,
            tool_calls: Some(vec![ToolCallFragment {
                index: Some(0),
                id: id.map(str::to_string),
                function: Some(FunctionFragment {
                    name: name.map(str::to_string),
                    arguments: arguments.map(str::to_string),
                }),
            }]),
        })
    }

    pub fn embedded(event: Value) -> Self {
        Self {
            choices: Vec::new(),
            event: Some(event),
        }
    }

    pub fn from_delta(delta: ChunkDelta) -> Self {
        Self {
            choices: vec![ChunkChoice { index: 0, delta }],
            event: None,
        }
    }
}
