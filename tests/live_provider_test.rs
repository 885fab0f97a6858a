// 真实提供商测试，需要网络和密钥
// 运行: LLMVISION_OPENAI_KEY=sk-... cargo test --test live_provider_test -- --ignored --nocapture

use serde_json::json;

use llmvision_lib::ai::{
    AnalysisOptions, AnalysisRequest, AnalysisService, ImageData, ImageRef, JsonSchema,
};
use llmvision_lib::{CoreSettings, ProviderConfig};

/// 1x1 红色 PNG
const RED_PIXEL_PNG: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mP8z8DwHwAFBQIAX8jx0gAAAABJRU5ErkJggg==";

#[tokio::test]
#[ignore]
async fn test_openai_structured_color_check() {
    llmvision_lib::init_logging();

    let Ok(api_key) = std::env::var("LLMVISION_OPENAI_KEY") else {
        println!("未设置 LLMVISION_OPENAI_KEY，跳过");
        return;
    };
    let base_url = std::env::var("LLMVISION_OPENAI_BASE")
        .unwrap_or_else(|_| "https://api.openai.com".to_string());

    let settings = CoreSettings {
        providers: vec![ProviderConfig::new("openai", base_url, api_key, "gpt-4o-mini")],
        ..CoreSettings::default()
    };
    let service = AnalysisService::new(settings).expect("创建分析服务失败");

    let schema = JsonSchema::new(json!({
        "type": "object",
        "properties": {
            "dominant_color": {"type": "string"},
            "confidence": {"type": "number", "minimum": 0, "maximum": 100}
        },
        "required": ["dominant_color", "confidence"]
    }))
    .unwrap();

    let frame = ImageRef::new(
        "camera.test",
        chrono::Utc::now(),
        ImageData::Base64(RED_PIXEL_PNG.to_string()),
        1.0,
    )
    .with_media_type("image/png");

    let request = AnalysisRequest::new("openai", "What is the dominant color of this image?")
        .with_images(vec![frame])
        .with_schema(schema);

    let start = std::time::Instant::now();
    let result = service
        .analyze(request, AnalysisOptions::default())
        .await
        .expect("分析失败");

    println!("耗时: {:.1}s", start.elapsed().as_secs_f64());
    println!("尝试次数: {}", result.metadata.attempts);
    println!("结构化结果: {:?}", result.structured_response);
    assert!(result.structured_response.is_some());
}
