//! Provider set construction from configuration.
//!
//! Each module slot (`ASR`, `TTS`, `LLM`, `VLLLM`, `VAD`) names a provider
//! config; the factory resolves its `type` to an implementation compiled
//! into this build. Unknown types fail construction rather than starting a
//! half-wired server.

use std::sync::Arc;

use crate::config::Config;
use crate::errors::ProviderError;
use crate::providers::dev::{DevAsr, DevTts};
use crate::providers::energy_vad::EnergyVad;
use crate::providers::openai::{OpenAiLlmProvider, OpenAiVlmProvider};
use crate::providers::pool::ProviderFactory;
use crate::providers::{AsrProvider, ProviderSet, TtsProvider, VadProvider, VlmProvider};

/// Build the pool factory for the configured module selection.
pub fn provider_factory(config: Arc<Config>) -> ProviderFactory {
    Arc::new(move || build_provider_set(&config))
}

/// Construct one provider set from the config.
pub fn build_provider_set(config: &Config) -> anyhow::Result<ProviderSet> {
    let llm_config = config
        .selected("LLM", &config.llm)
        .ok_or_else(|| ProviderError::Unavailable("no LLM module selected".into()))?;
    let llm = Arc::new(OpenAiLlmProvider::new(llm_config));

    let asr: Arc<dyn AsrProvider> = match config.selected("ASR", &config.asr) {
        Some(asr_config) => {
            let asr_type = asr_config
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("dev");
            match asr_type {
                "dev" => Arc::new(DevAsr::new()),
                other => {
                    return Err(ProviderError::Unsupported(format!(
                        "ASR provider type {} is not compiled into this build",
                        other
                    ))
                    .into())
                }
            }
        }
        None => Arc::new(DevAsr::new()),
    };

    let tts: Arc<dyn TtsProvider> = match config.selected("TTS", &config.tts) {
        Some(tts_config) => match tts_config.r#type.as_str() {
            "dev" | "" => Arc::new(DevTts::new(&tts_config.output_dir, &tts_config.voice)),
            other => {
                return Err(ProviderError::Unsupported(format!(
                    "TTS provider type {} is not compiled into this build",
                    other
                ))
                .into())
            }
        },
        None => Arc::new(DevTts::new("", "")),
    };

    let vad: Option<Arc<dyn VadProvider>> = config
        .selected("VAD", &config.vad)
        .map(|vad_config| Arc::new(EnergyVad::new(vad_config.aggressiveness)) as Arc<dyn VadProvider>);

    let vlm: Option<Arc<dyn VlmProvider>> = config
        .selected("VLLLM", &config.vllm)
        .map(|vllm_config| Arc::new(OpenAiVlmProvider::new(vllm_config)) as Arc<dyn VlmProvider>);

    Ok(ProviderSet {
        asr,
        llm,
        tts,
        vad,
        vlm,
    })
}
