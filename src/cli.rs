//! Interface de linha de comando do promoter baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (demo, bench, registry)
//! e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Promoter: promoção atômica de itens de trabalho entre filas de estado.
#[derive(Debug, Parser)]
#[command(name = "promoter", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: ./promoter.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa os cenários de demonstração contra um store em memória.
    Demo,

    /// Mede latência e vazão das promoções.
    Bench {
        /// Número de workers concorrentes (padrão: valor da configuração).
        #[arg(long)]
        workers: Option<usize>,

        /// Número total de promoções (padrão: valor da configuração).
        #[arg(long)]
        operations: Option<usize>,

        /// Itens por chamada; acima de 1 usa promoção em lote.
        #[arg(long, default_value_t = 1)]
        batch_size: usize,
    },

    /// Mostra a tabela de estados e transições carregada.
    Registry,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_bench_subcommand() {
        let cli = Cli::parse_from([
            "promoter",
            "bench",
            "--workers",
            "4",
            "--batch-size",
            "50",
        ]);
        match cli.command {
            Command::Bench {
                workers,
                operations,
                batch_size,
            } => {
                assert_eq!(workers, Some(4));
                assert!(operations.is_none());
                assert_eq!(batch_size, 50);
            }
            _ => panic!("expected Bench command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from(["promoter", "registry", "--config", "alt.toml", "-v"]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("alt.toml")));
        assert!(matches!(cli.command, Command::Registry));
    }

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["promoter", "demo"]);
        assert!(!cli.verbose);
        assert!(cli.config.is_none());
        assert!(matches!(cli.command, Command::Demo));
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
