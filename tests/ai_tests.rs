#[cfg(test)]
mod ai_module_tests {
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};
    use std::io::Write;

    use llmvision_lib::ai::{
        parse, translate, AnalysisRequest, ApiFormat, CapabilityTable, ImageData, ImageRef,
        JsonSchema, KeyFrameRule, ProviderCapability, StructuredOutputMechanism,
    };
    use llmvision_lib::{ErrorKind, ProviderConfig, SettingsManager};

    fn detection_schema() -> JsonSchema {
        JsonSchema::new(json!({
            "type": "object",
            "properties": {
                "label": {"type": "string", "enum": ["person", "vehicle", "animal"]},
                "confidence": {"type": "number", "minimum": 0, "maximum": 1},
                "moving": {"type": "boolean"},
                "zones": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["label", "confidence", "moving", "zones"]
        }))
        .unwrap()
    }

    fn frames() -> Vec<ImageRef> {
        vec![
            ImageRef::new(
                "camera.gate",
                Utc.with_ymd_and_hms(2024, 7, 1, 6, 30, 0).unwrap(),
                ImageData::Bytes(vec![1, 2, 3]),
                0.7,
            ),
            ImageRef::new(
                "camera.lane",
                Utc.with_ymd_and_hms(2024, 7, 1, 6, 30, 4).unwrap(),
                ImageData::Bytes(vec![4, 5, 6]),
                0.9,
            ),
        ]
    }

    /// 以各家线协议的形式包装一个满足 Schema 的回答
    fn dialect_response(capability: &ProviderCapability, answer: &Value) -> String {
        let text = answer.to_string();
        match (capability.api_format, capability.mechanism) {
            (ApiFormat::AnthropicMessages, _) => json!({
                "content": [{"type": "tool_use", "id": "t", "name": "return_structured_data", "input": answer}]
            }),
            (ApiFormat::GeminiGenerate, _) => json!({
                "candidates": [{"content": {"parts": [{"text": text}]}}]
            }),
            (ApiFormat::OllamaChat, _) => json!({
                "message": {"role": "assistant", "content": text},
                "done": true
            }),
            (_, StructuredOutputMechanism::None) => json!({
                "choices": [{"message": {"content": format!("Here you go:\n```json\n{}\n```", text)}}]
            }),
            _ => json!({"choices": [{"message": {"content": text}}]}),
        }
        .to_string()
    }

    #[test]
    fn test_schema_round_trip_for_every_builtin() {
        let table = CapabilityTable::builtin();
        let schema = detection_schema();
        let answer = json!({
            "label": "vehicle",
            "confidence": 0.82,
            "moving": true,
            "zones": ["driveway", "street"]
        });

        for id in table.ids() {
            let capability = table.get(id).unwrap();
            let request = AnalysisRequest::new(id, "What is at the gate?")
                .with_images(frames())
                .with_schema(schema.clone());

            let payload = translate(&request, capability, "vision-model").unwrap();
            assert_eq!(payload.mechanism, capability.mechanism, "{}", id);
            assert_eq!(payload.frames.len(), 2, "{}", id);

            let raw = dialect_response(capability, &answer);
            let result = parse(
                &raw,
                capability,
                Some(&schema),
                &payload.frames,
                KeyFrameRule::HighestQuality,
            )
            .unwrap();

            assert_eq!(result.structured_response.as_ref(), Some(&answer), "{}", id);
            assert_eq!(result.metadata.best_effort, payload.is_best_effort(), "{}", id);
            assert_eq!(
                result.key_frame.map(|f| f.source_camera_id),
                Some("camera.lane".to_string())
            );
        }
    }

    #[test]
    fn test_violating_answer_is_rejected_everywhere() {
        let table = CapabilityTable::builtin();
        let schema = detection_schema();
        let answer = json!({"label": "ghost", "confidence": 0.5, "moving": false, "zones": []});

        for id in table.ids() {
            let capability = table.get(id).unwrap();
            let raw = dialect_response(capability, &answer);
            let err = parse(&raw, capability, Some(&schema), &[], KeyFrameRule::Disabled)
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::SchemaInvalid, "{}", id);
        }
    }

    #[test]
    fn test_settings_file_with_custom_provider() {
        let yaml = r#"
worker_limit: 2
retry:
  max_attempts: 4
  initial_delay_ms: 250
  max_delay_ms: 4000
  jitter_factor: 0.1
providers:
  - id: openai
    api_base_url: https://api.openai.com
    api_key: sk-from-file
    model: gpt-4o
  - id: vllm-lab
    api_base_url: http://10.0.0.5:8000
    model: qwen2-vl
    mechanism: StrictSchema
    max_images_per_call: 3
"#;
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let manager = SettingsManager::load(file.path()).unwrap();
        let settings = manager.get();
        assert_eq!(settings.worker_limit, 2);
        assert_eq!(settings.retry.max_attempts, 4);

        let custom: &ProviderConfig = settings.provider("vllm-lab").unwrap();
        let capability = custom.resolve_capability(None).unwrap();
        assert_eq!(capability.mechanism, StructuredOutputMechanism::StrictSchema);
        assert_eq!(capability.api_format, ApiFormat::OpenAiChat);
        assert_eq!(capability.max_images_per_call, 3);
        assert!(!format!("{:?}", settings.provider("openai").unwrap()).contains("sk-from-file"));
    }

    #[test]
    fn test_custom_provider_truncates_images() {
        let capability =
            ProviderCapability::new("tiny", StructuredOutputMechanism::None, ApiFormat::OpenAiChat, 1);
        let mut table = CapabilityTable::new();
        table.register(capability.clone()).unwrap();
        assert!(table.register(capability.clone()).is_err());

        let request = AnalysisRequest::new("tiny", "describe").with_images(frames());
        let payload = translate(&request, &capability, "m").unwrap();
        assert_eq!(payload.frames.len(), 1);
        assert_eq!(payload.notes.len(), 1);
    }
}
