// projeto: finoexport
// file: src/main.rs
// Exports the Fin-O forecaster to ONNX plus the scaler and vocabulary JSON

mod neural;

use candle_core::Device;
use chrono::Utc;
use clap::Parser;
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use crate::neural::config::{ArchitectureSource, DecodingPolicy};
use crate::neural::data::{load_scaler, read_vocabulary, synthetic_batch};
use crate::neural::graph::{stage_graph, GraphOptions};
use crate::neural::metrics::{write_browser_config, ExportSummary};
use crate::neural::storage::{
    infer_architecture, load_model_weights, read_checkpoint, resolve_architecture, CheckpointLayout,
};
use crate::neural::verify::verify_export;
use crate::neural::{ExportConfig, ExportError, MissingFilePolicy, ModelSize, ParameterStore};

/// Batch size of the second verification pass.
const VERIFY_BATCH: usize = 3;

#[derive(Parser, Debug)]
#[command(
    name = "fino-export",
    version,
    about = "Converte o modelo Fin-O treinado para ONNX e exporta scaler/vocabulário em JSON",
    long_about = "Lê um checkpoint do forecaster seq2seq (encoder/decoder LSTM), gera o grafo ONNX com batch dinâmico, verifica a fidelidade contra o modelo em memória e grava scaler.json e vocab.json para a inferência no navegador."
)]
struct Cli {
    /// Tamanho do modelo
    #[arg(long, value_enum, required_unless_present = "init_config")]
    model_type: Option<ModelSizeArg>,

    /// Checkpoint treinado (.pth, .pt ou .safetensors)
    #[arg(long, required_unless_present = "init_config")]
    model_path: Option<PathBuf>,

    /// Parâmetros do scaler (JSON ou safetensors)
    #[arg(long, default_value = "model/scaler.json")]
    scaler_path: PathBuf,

    /// Vocabulário de categorias e estabelecimentos
    #[arg(long, default_value = "model/vocab.json")]
    vocab_path: PathBuf,

    /// Diretório de saída dos artefatos
    #[arg(long, default_value = "public/model")]
    output_dir: PathBuf,

    /// Arquivo de configuração TOML
    #[arg(long)]
    config: Option<PathBuf>,

    /// Arquivos ausentes viram avisos em vez de erros
    #[arg(long)]
    lenient: bool,

    /// Origem da largura oculta e do número de camadas
    #[arg(long, value_enum)]
    architecture: Option<ArchitectureArg>,

    /// Semente das entradas sintéticas
    #[arg(long, help = "Semente das entradas sintéticas (padrão 42)")]
    seed: Option<u64>,

    /// Não verificar o grafo exportado
    #[arg(long)]
    no_verify: bool,

    /// Grava a configuração padrão neste caminho e sai
    #[arg(long, value_name = "PATH")]
    init_config: Option<PathBuf>,

    /// Modo verboso de logging
    #[arg(long)]
    verbose: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ModelSizeArg {
    Small,
    Large,
}

impl From<ModelSizeArg> for ModelSize {
    fn from(arg: ModelSizeArg) -> Self {
        match arg {
            ModelSizeArg::Small => ModelSize::Small,
            ModelSizeArg::Large => ModelSize::Large,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ArchitectureArg {
    Checkpoint,
    Table,
}

impl From<ArchitectureArg> for ArchitectureSource {
    fn from(arg: ArchitectureArg) -> Self {
        match arg {
            ArchitectureArg::Checkpoint => ArchitectureSource::Checkpoint,
            ArchitectureArg::Table => ArchitectureSource::Table,
        }
    }
}

fn main() -> Result<(), ExportError> {
    let cli = Cli::parse();

    // Configurar logging
    setup_logging(cli.verbose);

    if let Some(path) = &cli.init_config {
        if let Err(e) = ExportConfig::default().save(path) {
            error!("❌ Falha ao gravar configuração: {}", e);
            std::process::exit(1);
        }
        return Ok(());
    }

    info!("🚀 Exportação Fin-O iniciada");
    info!("🕐 Iniciado em: {}", Utc::now().format("%Y-%m-%d %H:%M:%S"));

    match run(&cli) {
        Ok(summary) => {
            summary.print();
            info!("✅ Exportação concluída em {:.2}s", summary.elapsed_secs);
            info!("🏁 Finalizado em: {}", Utc::now().format("%Y-%m-%d %H:%M:%S"));
        }
        Err(e) => {
            error!("❌ Erro durante exportação: {}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn setup_logging(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp_secs()
        .init();
}

/// Configuration file (or defaults) with the command-line overrides applied.
fn resolve_settings(cli: &Cli) -> Result<ExportConfig, ExportError> {
    let mut settings = ExportConfig::load(cli.config.as_deref())?;
    if cli.lenient {
        settings.policy.missing_files = MissingFilePolicy::Lenient;
    }
    if let Some(source) = cli.architecture {
        settings.policy.architecture = source.into();
    }
    if let Some(seed) = cli.seed {
        settings.export.seed = seed;
    }
    if cli.no_verify {
        settings.export.verify = false;
    }
    settings.validate()?;
    Ok(settings)
}

fn run(cli: &Cli) -> Result<ExportSummary, ExportError> {
    let start_time = Instant::now();
    let settings = resolve_settings(cli)?;
    let policy = settings.policy.missing_files;
    let size: ModelSize = cli
        .model_type
        .ok_or_else(|| ExportError::Config("--model-type is required".to_string()))?
        .into();
    let model_path = cli
        .model_path
        .as_deref()
        .ok_or_else(|| ExportError::Config("--model-path is required".to_string()))?;
    let device = Device::Cpu;

    info!(
        "📊 Modelo: {} | Checkpoint: {} | Política: {:?}",
        size,
        model_path.display(),
        policy
    );

    // Every input is read before anything is written
    let vocab = read_vocabulary(&cli.vocab_path, policy)?;
    let scaler = load_scaler(&cli.scaler_path, policy)?;

    let store = match policy {
        MissingFilePolicy::Strict => {
            let store = read_checkpoint(model_path, &device)?;
            info!("✅ [Loader] Loaded {} tensors ({:?} layout)", store.len(), store.layout());
            store
        }
        MissingFilePolicy::Lenient => {
            let mut store = match &vocab {
                Some(v) => ParameterStore::random(&settings.model_config(size, v.sizes()), &device)?,
                None => ParameterStore::empty(),
            };
            if !load_model_weights(model_path, &mut store, &device) {
                warn!("⚠️ [Loader] Exporting RANDOMLY INITIALIZED weights: predictions will be meaningless");
            }
            if store.is_empty() {
                return Err(ExportError::Vocabulary(
                    "neither a checkpoint nor a vocabulary is available to size the model".to_string(),
                ));
            }
            store
        }
    };

    let vocab_sizes = match &vocab {
        Some(v) => v.sizes(),
        None => {
            let found = infer_architecture(&store)?.vocab;
            warn!(
                "⚠️ [Vocab] Using checkpoint vocabulary sizes: {} categories, {} merchants",
                found.categories, found.merchants
            );
            found
        }
    };
    let config = resolve_architecture(
        &settings.model_config(size, vocab_sizes),
        &store,
        settings.policy.architecture,
    )?;
    info!(
        "🛠️ Arquitetura: hidden {} | camadas {} | embedding {} | vocab {}/{}",
        config.hidden_dim,
        config.num_layers,
        config.embedding_dim,
        config.category_vocab_size,
        config.merchant_vocab_size
    );

    if let Some(vocab) = &vocab {
        vocab.check_against(config.vocab_sizes())?;
    }
    fs::create_dir_all(&cli.output_dir)?;

    let mut rng = StdRng::seed_from_u64(settings.export.seed);
    let sample = synthetic_batch(&config, 1, &mut rng, &device)?;
    let options = GraphOptions {
        model_size: size,
        opset_version: settings.export.opset_version,
    };
    let staged = stage_graph(&store, &config, &options, &sample, &cli.output_dir, &device)?;

    // A graph that fails the check is dropped and never replaces the previous export
    let fidelity = if settings.export.verify {
        let model = store.build_model(&config, DecodingPolicy::TeacherForced, &device)?;
        let batched = synthetic_batch(&config, VERIFY_BATCH, &mut rng, &device)?;
        verify_export(staged.path(), &model, &[sample, batched], settings.export.tolerance)?
    } else {
        warn!("⚠️ [Verify] Fidelity check skipped");
        Vec::new()
    };
    let graph_path = staged.commit()?;
    info!("✅ [Graph] Exported {}", graph_path.display());

    let mut artifacts = vec![graph_path];
    artifacts.push(write_browser_config(&config, size, &cli.output_dir)?);
    artifacts.push(scaler.write_to(&cli.output_dir)?);
    if let Some(vocab) = &vocab {
        artifacts.push(vocab.write_to(&cli.output_dir)?);
    }
    debug!("🔍 {} artifacts written", artifacts.len());

    if store.layout() == CheckpointLayout::Random {
        warn!("⚠️ [Loader] The exported graph carries untrained weights");
    }

    Ok(ExportSummary {
        model_size: size,
        num_parameters: store.num_parameters(),
        weights: store.layout(),
        config,
        artifacts,
        fidelity,
        elapsed_secs: start_time.elapsed().as_secs_f64(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural::config::{tiny_config, SizeProfile};
    use std::path::Path;
    use tempfile::tempdir;

    fn tiny_settings() -> ExportConfig {
        let tiny = tiny_config();
        let mut settings = ExportConfig::default();
        settings.model.embedding_dim = tiny.embedding_dim;
        settings.model.sequence_length = tiny.sequence_length;
        settings.model.forecast_horizon = tiny.forecast_horizon;
        settings.model.small = SizeProfile {
            hidden_dim: tiny.hidden_dim,
            num_layers: tiny.num_layers,
        };
        settings
    }

    /// Checkpoint, vocabulary, scaler and config for the tiny architecture.
    fn fixture(dir: &Path) -> Vec<String> {
        let model = dir.join("model.safetensors");
        ParameterStore::random(&tiny_config(), &Device::Cpu)
            .unwrap()
            .save_safetensors(&model)
            .unwrap();
        let vocab = dir.join("vocab.json");
        fs::write(
            &vocab,
            r#"{"categories": ["a", "b", "c", "d", "e"], "merchants": ["m0", "m1", "m2", "m3", "m4", "m5", "m6"]}"#,
        )
        .unwrap();
        let scaler = dir.join("scaler.json");
        fs::write(
            &scaler,
            serde_json::json!({
                "scale_": vec![2.0; 12],
                "mean_": vec![1.0; 12],
                "var_": vec![4.0; 12],
                "n_samples_seen_": 500
            })
            .to_string(),
        )
        .unwrap();
        let config = dir.join("export.toml");
        tiny_settings().save(&config).unwrap();

        [
            "fino-export",
            "--model-type",
            "small",
            "--model-path",
            model.to_str().unwrap(),
            "--vocab-path",
            vocab.to_str().unwrap(),
            "--scaler-path",
            scaler.to_str().unwrap(),
            "--output-dir",
            dir.join("out").to_str().unwrap(),
            "--config",
            config.to_str().unwrap(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["fino-export", "--model-type", "large", "--model-path", "m.pth"]).unwrap();
        assert!(matches!(cli.model_type, Some(ModelSizeArg::Large)));
        assert_eq!(cli.scaler_path, PathBuf::from("model/scaler.json"));
        assert_eq!(cli.vocab_path, PathBuf::from("model/vocab.json"));
        assert_eq!(cli.output_dir, PathBuf::from("public/model"));
        assert!(!cli.lenient);

        assert!(Cli::try_parse_from(["fino-export", "--model-path", "m.pth"]).is_err());
        assert!(Cli::try_parse_from(["fino-export", "--model-type", "medium", "--model-path", "m"]).is_err());
        assert!(Cli::try_parse_from(["fino-export", "--init-config", "export.toml"]).is_ok());
    }

    #[test]
    fn test_cli_overrides_settings() {
        let cli = Cli::try_parse_from([
            "fino-export",
            "--model-type",
            "small",
            "--model-path",
            "m.pth",
            "--lenient",
            "--architecture",
            "table",
            "--seed",
            "7",
            "--no-verify",
        ])
        .unwrap();
        let settings = resolve_settings(&cli).unwrap();
        assert_eq!(settings.policy.missing_files, MissingFilePolicy::Lenient);
        assert_eq!(settings.policy.architecture, ArchitectureSource::Table);
        assert_eq!(settings.export.seed, 7);
        assert!(!settings.export.verify);
    }

    #[test]
    fn test_full_export() {
        let dir = tempdir().unwrap();
        let cli = Cli::try_parse_from(fixture(dir.path())).unwrap();
        let summary = run(&cli).unwrap();

        let out = dir.path().join("out");
        for name in ["fin-o-small.onnx", "fin-o-small.config.json", "scaler.json", "vocab.json"] {
            assert!(out.join(name).is_file(), "missing {}", name);
        }
        assert_eq!(summary.weights, CheckpointLayout::Bare);
        assert_eq!(summary.fidelity.len(), 2);
        assert_eq!(summary.fidelity[1].batch_size, VERIFY_BATCH);
        assert!(summary.fidelity.iter().all(|r| r.within(1e-4)));
        assert_eq!(
            fs::read(out.join("vocab.json")).unwrap(),
            fs::read(dir.path().join("vocab.json")).unwrap()
        );
    }

    #[test]
    fn test_missing_scaler_strict_writes_nothing() {
        let dir = tempdir().unwrap();
        let mut args = fixture(dir.path());
        let pos = args.iter().position(|a| a == "--scaler-path").unwrap();
        args[pos + 1] = dir.path().join("absent.json").to_str().unwrap().to_string();

        let cli = Cli::try_parse_from(&args).unwrap();
        let err = run(&cli).unwrap_err();
        assert!(err.is_missing_file());
        assert!(!dir.path().join("out").exists());

        args.push("--lenient".to_string());
        let cli = Cli::try_parse_from(&args).unwrap();
        run(&cli).unwrap();
        let scaler: serde_json::Value =
            serde_json::from_slice(&fs::read(dir.path().join("out").join("scaler.json")).unwrap()).unwrap();
        assert_eq!(scaler["n_samples_seen_"], 1000);
    }

    #[test]
    fn test_failed_verification_keeps_previous_graph() {
        let dir = tempdir().unwrap();
        let args = fixture(dir.path());
        let mut settings = tiny_settings();
        settings.export.tolerance = 1e-30;
        settings.save(&dir.path().join("export.toml")).unwrap();

        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();
        let previous = out.join("fin-o-small.onnx");
        fs::write(&previous, b"PREVIOUS EXPORT").unwrap();

        let cli = Cli::try_parse_from(&args).unwrap();
        let err = run(&cli).unwrap_err();
        assert!(matches!(err, ExportError::Graph(_)), "{}", err);
        assert_eq!(fs::read(&previous).unwrap(), b"PREVIOUS EXPORT");
        assert!(!out.join("scaler.json").exists());
        assert!(!out.join("vocab.json").exists());
        // The staged graph is cleaned up
        assert_eq!(fs::read_dir(&out).unwrap().count(), 1);
    }

    #[test]
    fn test_vocab_mismatch_fails() {
        let dir = tempdir().unwrap();
        let args = fixture(dir.path());
        fs::write(
            dir.path().join("vocab.json"),
            r#"{"categories": ["a", "b"], "merchants": ["m0"]}"#,
        )
        .unwrap();
        let cli = Cli::try_parse_from(&args).unwrap();
        assert!(matches!(run(&cli).unwrap_err(), ExportError::ArchitectureMismatch(_)));
    }
}
