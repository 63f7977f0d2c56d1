//! Interface de terminal do promoter: spinner do bench e saída colorida.
//!
//! Usa as crates `indicatif` para o spinner de progresso e `console` para
//! estilização com cores.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use promoter::error::PromotionError;
use promoter::harness::LoadReport;
use promoter::state_machine::{BatchOutcome, ItemStatus, PromotionOutcome, TransitionRegistry};

/// Saída colorida compartilhada pelos subcomandos.
pub struct Terminal {
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl Default for Terminal {
    fn default() -> Self {
        Self {
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }
}

impl Terminal {
    /// Cabeçalho de uma seção da demonstração.
    pub fn heading(&self, title: &str) {
        println!();
        println!("{}", self.yellow.apply_to(format!("─── {title} ───")));
    }

    /// Resultado de uma promoção individual: verde se aceita, vermelho se rejeitada.
    pub fn promotion(&self, result: &Result<PromotionOutcome, PromotionError>) {
        match result {
            Ok(outcome) => println!(
                "  {} {} → {} {}",
                self.green.apply_to("✓"),
                outcome.item_id,
                outcome.new_state,
                self.dim.apply_to(&outcome.evidence_record_id)
            ),
            Err(e) => println!("  {} {e}", self.red.apply_to("✗")),
        }
    }

    /// Resultado de um lote: total promovido e cada falha por item.
    pub fn batch(&self, outcome: &BatchOutcome) {
        let mark = if outcome.all_promoted() {
            self.green.apply_to("✓")
        } else {
            self.yellow.apply_to("!")
        };
        println!(
            "  {mark} {} promoted, {} failed",
            outcome.success_count,
            outcome.failures.len()
        );
        for failure in &outcome.failures {
            println!(
                "  {} {}: {}",
                self.red.apply_to("✗"),
                failure.item_id,
                failure.reason
            );
        }
    }

    pub fn status(&self, status: &ItemStatus) {
        let position = status
            .queue_position
            .map_or_else(|| "not queued".to_string(), |p| format!("position {p}"));
        println!(
            "  {} is {} ({position})",
            status.item_id,
            self.green.apply_to(&status.state)
        );
    }

    /// Imprime a tabela de estados e transições.
    pub fn registry(&self, registry: &TransitionRegistry) {
        println!("{}", self.yellow.apply_to("States"));
        for state in registry.states() {
            let role = match (state.initial, state.terminal) {
                (true, _) => " (initial)",
                (_, true) => " (terminal)",
                _ => "",
            };
            println!("  {}{}", state.name, self.dim.apply_to(role));
        }

        println!("{}", self.yellow.apply_to("Transitions"));
        for transition in registry.transitions() {
            let required: Vec<String> = transition
                .required
                .iter()
                .map(|rule| format!("{}: {}", rule.field, rule.kind))
                .collect();
            println!(
                "  {} {} → {}  {}",
                self.green.apply_to(&transition.name),
                transition.from,
                transition.to,
                self.dim.apply_to(required.join(", "))
            );
        }
    }

    /// Imprime o relatório do bench com o veredito colorido.
    pub fn report(&self, report: &LoadReport) {
        println!("{report}");
        let violations = report.violations();
        if violations.is_empty() {
            println!("{}", self.green.apply_to("✓ within latency and throughput targets"));
        } else {
            for violation in violations {
                println!("{} {violation}", self.red.apply_to("✗"));
            }
        }
    }
}

/// Spinner exibido enquanto o bench roda.
pub struct BenchProgress {
    pb: ProgressBar,
}

impl BenchProgress {
    /// Inicia o spinner com a descrição da carga.
    pub fn start(description: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(description.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        Self { pb }
    }

    /// Remove o spinner antes de imprimir o relatório.
    pub fn finish(self) {
        self.pb.finish_and_clear();
    }
}
