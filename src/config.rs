//! Configuração do promoter carregada a partir de `promoter.toml`.
//!
//! A struct [`PromoterConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `PROMOTER_CALL_TIMEOUT_MS` tem precedência sobre o arquivo.

use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::engine::EngineOptions;
use crate::error::PromotionError;
use crate::state_machine::{StateSpec, TransitionRegistry, TransitionSpec};

/// Arquivo procurado no diretório atual quando nenhum caminho é informado.
pub const DEFAULT_CONFIG_FILE: &str = "promoter.toml";

/// Configuração de nível superior carregada de `promoter.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct PromoterConfig {
    /// Tempo máximo de cada chamada ao store, em milissegundos.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Retenção dos registros de evidência, em segundos.
    #[serde(default = "default_evidence_retention_secs")]
    pub evidence_retention_secs: u64,

    /// Valida a evidência no cliente antes da chamada atômica.
    #[serde(default = "default_precheck_evidence")]
    pub precheck_evidence: bool,

    /// Número de workers concorrentes no `bench` (padrão: núcleos disponíveis).
    #[serde(default = "default_bench_workers")]
    pub bench_workers: usize,

    /// Número total de promoções no `bench`.
    #[serde(default = "default_bench_operations")]
    pub bench_operations: usize,

    /// Estados do pipeline; substitui o pipeline padrão junto com `transitions`.
    #[serde(default)]
    pub states: Option<Vec<StateSpec>>,

    /// Transições do pipeline; exige `states`.
    #[serde(default)]
    pub transitions: Option<Vec<TransitionSpec>>,
}

// Valor padrão para o timeout de chamada: 250ms.
fn default_call_timeout_ms() -> u64 {
    250
}

// Valor padrão para a retenção: 30 dias.
fn default_evidence_retention_secs() -> u64 {
    2_592_000
}

fn default_precheck_evidence() -> bool {
    true
}

// Um worker por núcleo: workers a mais só medem a espera pelo escalonador.
fn default_bench_workers() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

fn default_bench_operations() -> usize {
    10_000
}

impl Default for PromoterConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
            evidence_retention_secs: default_evidence_retention_secs(),
            precheck_evidence: default_precheck_evidence(),
            bench_workers: default_bench_workers(),
            bench_operations: default_bench_operations(),
            states: None,
            transitions: None,
        }
    }
}

impl PromoterConfig {
    /// Carrega a configuração de `promoter.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// Carrega a configuração de um caminho explícito.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<PromoterConfig>(&contents)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo de configuração.
        if let Ok(raw) = std::env::var("PROMOTER_CALL_TIMEOUT_MS")
            && !raw.is_empty()
        {
            config.call_timeout_ms = raw
                .parse()
                .with_context(|| format!("PROMOTER_CALL_TIMEOUT_MS={raw}"))?;
        }

        Ok(config)
    }

    /// Monta o registro de transições: o do arquivo, se houver, ou o padrão.
    pub fn registry(&self) -> Result<TransitionRegistry, PromotionError> {
        match (&self.states, &self.transitions) {
            (None, None) => Ok(TransitionRegistry::default_pipeline()),
            (Some(states), Some(transitions)) => {
                TransitionRegistry::new(states.clone(), transitions.clone())
            }
            _ => Err(PromotionError::Config(
                "`states` and `transitions` must be configured together".into(),
            )),
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            evidence_retention: Duration::from_secs(self.evidence_retention_secs),
            precheck_evidence: self.precheck_evidence,
        }
    }
}
