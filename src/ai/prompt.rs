/// Prompt 模板系统
///
/// 提供发送给模型的固定文本：尽力而为模式下的 JSON 指令、多帧说明、伪工具描述

use std::collections::HashMap;

use crate::ai::frame_selection::ImageRef;
use crate::ai::schema::JsonSchema;

/// Prompt 模板类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptTemplate {
    /// 无强制机制时要求模型输出 JSON
    JsonInstruction,

    /// 多帧/多摄像头说明
    FrameContext,
}

/// Prompt 构建器
pub struct PromptBuilder {
    template: PromptTemplate,
    variables: HashMap<String, String>,
}

impl PromptBuilder {
    /// 创建新的 Prompt 构建器
    pub fn new(template: PromptTemplate) -> Self {
        Self {
            template,
            variables: HashMap::new(),
        }
    }

    /// 设置变量
    pub fn set_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// 构建最终的 Prompt
    pub fn build(&self) -> String {
        let base_template = self.get_base_template();
        self.replace_variables(base_template)
    }

    fn get_base_template(&self) -> &'static str {
        match self.template {
            PromptTemplate::JsonInstruction => JSON_INSTRUCTION_TEMPLATE,
            PromptTemplate::FrameContext => FRAME_CONTEXT_TEMPLATE,
        }
    }

    /// 单遍替换模板中的变量，未提供的变量保持原样；代入的值不会再被展开
    fn replace_variables(&self, template: &str) -> String {
        let mut result = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("{{") {
            result.push_str(&rest[..start]);
            let after_open = &rest[start + 2..];
            match after_open.find("}}") {
                Some(end) => {
                    let key = &after_open[..end];
                    match self.variables.get(key) {
                        Some(value) => result.push_str(value),
                        None => {
                            result.push_str("{{");
                            result.push_str(key);
                            result.push_str("}}");
                        }
                    }
                    rest = &after_open[end + 2..];
                }
                None => {
                    result.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        result.push_str(rest);

        result
    }
}

/// 伪工具名称
pub const STRUCTURED_TOOL_NAME: &str = "return_structured_data";

/// 伪工具描述
pub const STRUCTURED_TOOL_DESCRIPTION: &str =
    "Return the analysis result as structured data matching the input schema.";

const JSON_INSTRUCTION_TEMPLATE: &str = r#"Respond ONLY with a single JSON object that matches the following JSON schema. Do not wrap it in markdown and do not add any other text.
Required fields: {{required}}
Schema:
{{schema}}"#;

const FRAME_CONTEXT_TEMPLATE: &str = r#"The following {{count}} images are frames from {{cameras}}, in chronological order:
{{captions}}"#;

/// 把 JSON 指令附加到用户 prompt 之后
pub fn json_instruction(prompt: &str, schema: &JsonSchema) -> String {
    let required = schema
        .as_value()
        .get("required")
        .and_then(|r| r.as_array())
        .map(|names| {
            names
                .iter()
                .filter_map(|n| n.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "none".to_string());
    let schema_text = serde_json::to_string_pretty(schema.as_value())
        .unwrap_or_else(|_| schema.as_value().to_string());

    let instruction = PromptBuilder::new(PromptTemplate::JsonInstruction)
        .set_variable("required", required)
        .set_variable("schema", schema_text)
        .build();

    format!("{}\n\n{}", prompt, instruction)
}

/// 多帧说明；单帧时不需要
pub fn frame_context(frames: &[ImageRef]) -> Option<String> {
    if frames.len() < 2 {
        return None;
    }

    let mut cameras: Vec<&str> = Vec::new();
    for frame in frames {
        if !cameras.contains(&frame.source_camera_id.as_str()) {
            cameras.push(&frame.source_camera_id);
        }
    }

    let captions: Vec<String> = frames
        .iter()
        .enumerate()
        .map(|(i, f)| {
            format!(
                "Image {}: {} at {}",
                i + 1,
                f.source_camera_id,
                f.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
            )
        })
        .collect();

    Some(
        PromptBuilder::new(PromptTemplate::FrameContext)
            .set_variable("count", frames.len().to_string())
            .set_variable("cameras", cameras.join(", "))
            .set_variable("captions", captions.join("\n"))
            .build(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::frame_selection::ImageData;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn test_json_instruction() {
        let schema = JsonSchema::new(json!({
            "type": "object",
            "properties": {"confidence": {"type": "number"}},
            "required": ["confidence"]
        }))
        .unwrap();

        let prompt = json_instruction("What is happening?", &schema);
        assert!(prompt.starts_with("What is happening?\n\n"));
        assert!(prompt.contains("Required fields: confidence"));
        assert!(prompt.contains("\"confidence\""));
    }

    #[test]
    fn test_json_instruction_without_required() {
        let schema = JsonSchema::new(json!({"type": "object"})).unwrap();
        assert!(json_instruction("x", &schema).contains("Required fields: none"));
    }

    #[test]
    fn test_frame_context() {
        let at = |s| Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, s).unwrap();
        let frames = vec![
            ImageRef::new("camera.front", at(1), ImageData::Base64("a".into()), 0.5),
            ImageRef::new("camera.back", at(2), ImageData::Base64("b".into()), 0.5),
            ImageRef::new("camera.front", at(3), ImageData::Base64("c".into()), 0.5),
        ];

        let text = frame_context(&frames).unwrap();
        assert!(text.starts_with("The following 3 images are frames from camera.front, camera.back"));
        assert!(text.contains("Image 2: camera.back at 2024-05-01 08:00:02 UTC"));
        assert!(frame_context(&frames[..1]).is_none());
    }

    #[test]
    fn test_substituted_values_are_not_expanded() {
        let at = |s| Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, s).unwrap();
        let frames = vec![
            ImageRef::new("cam {{captions}}", at(1), ImageData::Base64("a".into()), 0.5),
            ImageRef::new("cam {{count}}", at(2), ImageData::Base64("b".into()), 0.5),
        ];

        let expected = "The following 2 images are frames from cam {{captions}}, cam {{count}}, in chronological order:\n\
                        Image 1: cam {{captions}} at 2024-05-01 08:00:01 UTC\n\
                        Image 2: cam {{count}} at 2024-05-01 08:00:02 UTC";
        for _ in 0..5 {
            assert_eq!(frame_context(&frames).unwrap(), expected);
        }
    }

    #[test]
    fn test_missing_variable_kept() {
        let text = PromptBuilder::new(PromptTemplate::FrameContext)
            .set_variable("count", "3")
            .build();
        assert!(text.starts_with("The following 3 images are frames from {{cameras}},"));
        assert!(text.ends_with("{{captions}}"));
    }
}
