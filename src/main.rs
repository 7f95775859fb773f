// projeto: genretrain
// file: src/main.rs
// Treinamento de classificadores de gênero/artista a partir de features simbólicas e sequências de notas

mod config;
mod neural;

use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{error, info, warn};
use ndarray::{Array2, ArrayView1};

use crate::config::AppConfig;
use crate::neural::conv_lstm::{self, ConvLstmParams};
use crate::neural::dense::{self, DenseParams, OutputActivation};
use crate::neural::features::{assemble, load_feature_file};
use crate::neural::metrics::{confusion_matrix, log_confusion, predicted_classes, AccuracyHistory};
use crate::neural::notes::{load_songs, load_split};
use crate::neural::plot::{accuracy_plot, write_plot, write_png};
use crate::neural::storage::{checkpoint_kind, load_checkpoint, save_checkpoint, Checkpoint, ModelKind};
use crate::neural::utils::{argmax, seeded_rng, OptimizerKind};
use crate::neural::windowing::{window_songs, WindowConfig, WindowPolicy};
use crate::neural::{ConvLstmConfig, ConvLstmNetwork, DenseConfig, DenseNetwork, TrainingError};

#[derive(Parser, Debug)]
#[command(
    name = "genre-train",
    version,
    about = "Treina classificadores de gênero/artista musical",
    long_about = "Treina uma rede densa sobre vetores de features jSymbolic2 ou uma rede convolucional + LSTM sobre janelas de notas extraídas de arquivos MIDI."
)]
struct Cli {
    /// Arquivo de configuração TOML
    #[arg(long, short, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Ativar logging detalhado
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rede densa sobre os arquivos XML de features
    Features(FeaturesArgs),
    /// Rede convolucional + LSTM sobre janelas de notas
    Sequences(SequencesArgs),
    /// Classifica músicas com um modelo salvo (denso: XML de features; conv+LSTM: MIDI/JSON)
    Predict(PredictArgs),
}

#[derive(Args, Debug)]
struct FeaturesArgs {
    /// Número de rodadas de treino (cada uma registra a acurácia de teste)
    #[arg(long)]
    rounds: Option<usize>,

    /// Épocas por rodada
    #[arg(long)]
    epochs_per_round: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    #[arg(long, value_enum)]
    optimizer: Option<OptimizerArg>,

    /// Ativação da camada de saída
    #[arg(long, value_enum)]
    output: Option<OutputArg>,

    /// Semente para a divisão treino/teste e inicialização
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args, Debug)]
struct SequencesArgs {
    /// Diretório com train/<classe> e test/<classe>
    #[arg(long)]
    corpus: Option<String>,

    #[arg(long)]
    iterations: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    /// Estratégia de janelamento das músicas
    #[arg(long, value_enum)]
    policy: Option<PolicyArg>,

    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args, Debug)]
struct PredictArgs {
    /// Checkpoint salvo (.bin ou .json)
    #[arg(long)]
    model: PathBuf,

    /// Arquivo XML de features, ou arquivo/diretório de músicas para modelos conv+LSTM
    #[arg(long, alias = "features")]
    input: PathBuf,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OptimizerArg {
    Sgd,
    Adam,
}

impl From<OptimizerArg> for OptimizerKind {
    fn from(arg: OptimizerArg) -> Self {
        match arg {
            OptimizerArg::Sgd => OptimizerKind::Sgd,
            OptimizerArg::Adam => OptimizerKind::Adam,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OutputArg {
    Sigmoid,
    Softmax,
}

impl From<OutputArg> for OutputActivation {
    fn from(arg: OutputArg) -> Self {
        match arg {
            OutputArg::Sigmoid => OutputActivation::Sigmoid,
            OutputArg::Softmax => OutputActivation::Softmax,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PolicyArg {
    FirstTracks,
    AllTracks,
    Augmented,
}

impl From<PolicyArg> for WindowPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::FirstTracks => WindowPolicy::FirstTracks,
            PolicyArg::AllTracks => WindowPolicy::AllTracks,
            PolicyArg::Augmented => WindowPolicy::Augmented,
        }
    }
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

fn apply_feature_args(config: &mut AppConfig, args: &FeaturesArgs) {
    let dense = &mut config.dense;
    if let Some(rounds) = args.rounds {
        dense.rounds = rounds;
    }
    if let Some(epochs) = args.epochs_per_round {
        dense.epochs_per_round = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        dense.batch_size = batch_size;
    }
    if let Some(lr) = args.learning_rate {
        dense.learning_rate = lr;
    }
    if let Some(optimizer) = args.optimizer {
        dense.optimizer = optimizer.into();
    }
    if let Some(output) = args.output {
        dense.output = output.into();
    }
    if args.seed.is_some() {
        config.features.seed = args.seed;
    }
}

fn apply_sequence_args(config: &mut AppConfig, args: &SequencesArgs) {
    if let Some(corpus) = &args.corpus {
        config.sequences.corpus_dir = corpus.clone();
    }
    if let Some(iterations) = args.iterations {
        config.conv_lstm.iterations = iterations;
    }
    if let Some(batch_size) = args.batch_size {
        config.conv_lstm.batch_size = batch_size;
    }
    if let Some(lr) = args.learning_rate {
        config.conv_lstm.learning_rate = lr;
    }
    if let Some(policy) = args.policy {
        config.sequences.window.policy = policy.into();
    }
    if args.seed.is_some() {
        config.sequences.seed = args.seed;
    }
}

fn save_history(config: &AppConfig, history: &AccuracyHistory, title: &str, x_label: &str, x_max: f64) -> Result<(), TrainingError> {
    history.save_to_csv(Path::new(&config.paths.history_dir).join(format!("{}.csv", title)))?;
    if history.is_empty() {
        warn!("⚠️ Nenhum ponto de acurácia registrado, gráficos não gerados");
        return Ok(());
    }
    info!("📝 {} pontos de acurácia", history.len());

    let plots = Path::new(&config.paths.plots_dir);
    let plot = accuracy_plot(history, title, x_label, x_max);
    write_plot(&plot, &plots.join(format!("{}.html", title)))?;
    write_png(history, title, x_label, x_max, &plots.join(format!("{}.png", title)))?;
    Ok(())
}

/// Dense network over jSymbolic2 features. Returns the checkpoint path.
fn run_features(config: &AppConfig) -> Result<PathBuf, TrainingError> {
    let features = &config.features;
    let dense_cfg = &config.dense;
    let mut rng = seeded_rng(features.seed);

    info!("🎼 Carregando {} arquivos de features", features.classes.len());
    let parsed = features
        .classes
        .iter()
        .enumerate()
        .map(|(label, class)| load_feature_file(&class.path, label))
        .collect::<Result<Vec<_>, _>>()?;

    let mut set = assemble(parsed)?;
    if set.is_empty() {
        return Err(TrainingError::DataProcessing("feature files contain no songs".to_string()));
    }
    info!("📊 {} músicas, {} features", set.len(), set.n_features());
    let scaler = set.standardize()?;
    let data = set.split(features.train_ratio, &mut rng)?;
    info!("✂️ Treino: {} | Teste: {}", data.y_train.len(), data.y_test.len());

    let class_names: Vec<String> = features.classes.iter().map(|c| c.name.clone()).collect();
    let mut network = DenseNetwork::new(set.n_features(), dense_cfg, class_names.len(), &mut rng)?;

    let start = Instant::now();
    let (history, evaluation) = dense::train(&mut network, &data, dense_cfg, &mut rng)?;
    info!("⏱️ Treino concluído em {:.1}s", start.elapsed().as_secs_f64());

    let predicted = predicted_classes(&network.predict(&data.x_test)?)?;
    log_confusion(
        &confusion_matrix(&predicted, &data.y_test, class_names.len())?,
        &class_names,
    );

    let checkpoint = Checkpoint::new(
        ModelKind::Dense,
        evaluation.accuracy,
        class_names,
        dense_cfg.clone(),
        network.params().clone(),
    )
    .with_scaler(scaler)
    .with_feature_names(set.feature_names.clone());
    let path = save_checkpoint(
        Path::new(&config.paths.models_dir),
        &format!("dense_xml_{}", features.tag),
        &checkpoint,
        config.paths.checkpoint_format,
    )?;

    let layers: Vec<String> = dense_cfg.hidden_layers.iter().map(|n| n.to_string()).collect();
    let title = format!(
        "Testing_{}_Dense_{}layers{}_{:.1}dropout_{}batch_{:.3}test",
        features.tag,
        dense_cfg.hidden_layers.len(),
        layers.join("-"),
        dense_cfg.dropout,
        dense_cfg.batch_size,
        evaluation.accuracy
    );
    save_history(config, &history, &title, "Rounds", dense_cfg.rounds as f64)?;
    Ok(path)
}

/// Conv+LSTM network over note windows. Returns the checkpoint path.
fn run_sequences(config: &AppConfig) -> Result<PathBuf, TrainingError> {
    let seq = &config.sequences;
    let net_cfg = &config.conv_lstm;
    let mut rng = seeded_rng(seq.seed);

    let train_songs = load_split(&seq.corpus_dir, "train", &seq.classes)?;
    let test_songs = load_split(&seq.corpus_dir, "test", &seq.classes)?;
    info!("🎵 Músicas: {} treino, {} teste", train_songs.len(), test_songs.len());
    if train_songs.is_empty() || test_songs.is_empty() {
        return Err(TrainingError::DataProcessing(format!(
            "no readable songs under {}",
            seq.corpus_dir
        )));
    }

    let mut train_list = train_songs.songs;
    let mut test_list = test_songs.songs;
    let train_set = window_songs(&mut train_list, &train_songs.labels, &seq.window)?;
    let test_set = window_songs(&mut test_list, &test_songs.labels, &seq.window)?;
    info!(
        "📐 X_train: {:?} | X_test: {:?}",
        train_set.x.dim(),
        test_set.x.dim()
    );
    if train_set.is_empty() || test_set.is_empty() {
        return Err(TrainingError::DataProcessing(
            "no song produced a window; check n_tracks / n_notes".to_string(),
        ));
    }
    if train_set.placeholder_tracks + test_set.placeholder_tracks > 0 {
        warn!(
            "⚠️ Placeholder tracks: {} treino, {} teste",
            train_set.placeholder_tracks, test_set.placeholder_tracks
        );
    }

    let mut network = ConvLstmNetwork::new(train_set.sample_shape(), net_cfg, seq.classes.len(), &mut rng)?;
    let start = Instant::now();
    let (history, evaluation) = conv_lstm::train(&mut network, &train_set, &test_set, net_cfg, &mut rng)?;
    info!("⏱️ Treino concluído em {:.1}s", start.elapsed().as_secs_f64());

    let predicted = predicted_classes(&network.predict(&test_set.x)?)?;
    log_confusion(
        &confusion_matrix(&predicted, &test_set.labels, seq.classes.len())?,
        &seq.classes,
    );

    let checkpoint: Checkpoint<_, (ConvLstmConfig, WindowConfig)> = Checkpoint::new(
        ModelKind::ConvLstm,
        evaluation.accuracy,
        seq.classes.clone(),
        (net_cfg.clone(), seq.window.clone()),
        network.params().clone(),
    );
    let path = save_checkpoint(
        Path::new(&config.paths.models_dir),
        &format!("conv_lstm_{}", seq.tag),
        &checkpoint,
        config.paths.checkpoint_format,
    )?;

    let title = format!(
        "Testing_{}_ConvLstm_{}iter_{}batch_{:.3}test",
        seq.tag, net_cfg.iterations, net_cfg.batch_size, evaluation.accuracy
    );
    save_history(config, &history, &title, "Iterations", net_cfg.iterations as f64)?;
    Ok(path)
}

#[derive(Debug, Clone, PartialEq)]
struct SongPrediction {
    song: String,
    class: String,
    probability: f64,
}

fn best_class(song: String, probs: ArrayView1<f64>, class_names: &[String]) -> Result<SongPrediction, TrainingError> {
    let class = argmax(probs)?;
    Ok(SongPrediction {
        song,
        class: class_names.get(class).cloned().unwrap_or_else(|| "?".to_string()),
        probability: probs[class],
    })
}

fn log_checkpoint<P, C>(checkpoint: &Checkpoint<P, C>) {
    info!(
        "📦 Modelo {:?} de {} (acurácia {:.3}), classes {:?}",
        checkpoint.kind,
        checkpoint.created_at.format("%Y-%m-%d %H:%M"),
        checkpoint.accuracy,
        checkpoint.class_names
    );
}

/// One prediction per song of a feature file, after the stored scaling.
fn predict_dense(model: &Path, input: &Path) -> Result<Vec<SongPrediction>, TrainingError> {
    let checkpoint: Checkpoint<DenseParams, DenseConfig> = load_checkpoint(model, ModelKind::Dense)?;
    log_checkpoint(&checkpoint);

    let set = assemble(vec![load_feature_file(input, 0)?])?;
    set.check_feature_names(&checkpoint.feature_names, &input.display().to_string())?;
    let x = match &checkpoint.scaler {
        Some(scaler) => scaler.transform(&set.x)?,
        None => set.x.clone(),
    };

    let network = DenseNetwork::from_params(checkpoint.params)?;
    let probs = network.predict(&x)?;
    set.song_ids
        .iter()
        .zip(probs.rows())
        .map(|(song, row)| best_class(song.clone(), row, &checkpoint.class_names))
        .collect()
}

/// One prediction per song, averaging the probabilities of its windows.
fn predict_conv_lstm(model: &Path, input: &Path) -> Result<Vec<SongPrediction>, TrainingError> {
    let checkpoint: Checkpoint<ConvLstmParams, (ConvLstmConfig, WindowConfig)> =
        load_checkpoint(model, ModelKind::ConvLstm)?;
    log_checkpoint(&checkpoint);
    let (_, window) = &checkpoint.config;
    let network = ConvLstmNetwork::from_params(checkpoint.params)?;

    let mut songs = load_songs(input)?;
    let labels = vec![0; songs.len()];
    let set = window_songs(&mut songs, &labels, window)?;
    if set.is_empty() {
        return Err(TrainingError::DataProcessing(format!(
            "no song in {} produced a window",
            input.display()
        )));
    }

    let probs = network.predict(&set.x)?;
    let mut sums = Array2::<f64>::zeros((songs.len(), probs.ncols()));
    let mut counts = vec![0usize; songs.len()];
    for (row, &song) in probs.rows().into_iter().zip(&set.song_indices) {
        let mut total = sums.row_mut(song);
        total += &row;
        counts[song] += 1;
    }

    let mut predictions = Vec::new();
    for (i, song) in songs.iter().enumerate() {
        if counts[i] == 0 {
            warn!("⚠️ {}: nenhuma janela, ignorada", song.name);
            continue;
        }
        let mean = sums.row(i).mapv(|v| v / counts[i] as f64);
        predictions.push(best_class(song.name.clone(), mean.view(), &checkpoint.class_names)?);
    }
    Ok(predictions)
}

/// Prints the predicted class of every song in `input`.
fn run_predict(model: &Path, input: &Path) -> Result<(), TrainingError> {
    let predictions = match checkpoint_kind(model)? {
        ModelKind::Dense => predict_dense(model, input)?,
        ModelKind::ConvLstm => predict_conv_lstm(model, input)?,
    };
    for p in &predictions {
        println!("{}\t{}\t{:.3}", p.song, p.class, p.probability);
    }
    Ok(())
}

fn run(cli: Cli) -> Result<(), TrainingError> {
    let mut config = AppConfig::load(&cli.config)?;

    match &cli.command {
        Command::Features(args) => {
            apply_feature_args(&mut config, args);
            config.validate_features()?;
            run_features(&config).map(|_| ())
        }
        Command::Sequences(args) => {
            apply_sequence_args(&mut config, args);
            config.validate_sequences()?;
            run_sequences(&config).map(|_| ())
        }
        Command::Predict(args) => run_predict(&args.model, &args.input),
    }
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    info!("🚀 genre-train {}", env!("CARGO_PKG_VERSION"));
    if let Err(e) = run(cli) {
        error!("❌ {}", e);
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeatureClass;
    use crate::neural::notes::{Note, Song, Track};

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "genre-train",
            "--config",
            "custom.toml",
            "features",
            "--rounds",
            "2",
            "--optimizer",
            "adam",
            "--output",
            "softmax",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("custom.toml"));

        let mut config = AppConfig::default();
        match &cli.command {
            Command::Features(args) => apply_feature_args(&mut config, args),
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(config.dense.rounds, 2);
        assert_eq!(config.dense.optimizer, OptimizerKind::Adam);
        assert_eq!(config.dense.output, OutputActivation::Softmax);
        assert_eq!(config.dense.epochs_per_round, 50);
    }

    #[test]
    fn test_sequence_overrides() {
        let cli = Cli::try_parse_from([
            "genre-train",
            "sequences",
            "--policy",
            "all-tracks",
            "--iterations",
            "10",
            "--seed",
            "7",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);

        let mut config = AppConfig::default();
        if let Command::Sequences(args) = &cli.command {
            apply_sequence_args(&mut config, args);
        }
        assert_eq!(config.sequences.window.policy, WindowPolicy::AllTracks);
        assert_eq!(config.conv_lstm.iterations, 10);
        assert_eq!(config.sequences.seed, Some(7));
    }

    #[test]
    fn test_predict_requires_paths() {
        assert!(Cli::try_parse_from(["genre-train", "predict", "--model", "m.bin"]).is_err());
        let cli = Cli::try_parse_from(["genre-train", "predict", "--model", "m.bin", "--features", "f.xml"]).unwrap();
        match cli.command {
            Command::Predict(args) => assert_eq!(args.input, PathBuf::from("f.xml")),
            other => panic!("unexpected command {:?}", other),
        }
    }

    fn feature_xml(names: &[&str], songs: &[(String, Vec<f64>)]) -> String {
        let body: String = songs
            .iter()
            .map(|(id, values)| {
                let features: String = names
                    .iter()
                    .zip(values)
                    .map(|(n, v)| format!("<feature><name>{}</name><v>{}</v></feature>", n, v.to_string().replace('.', ",")))
                    .collect();
                format!("<data_set><data_set_id>{}</data_set_id>{}</data_set>", id, features)
            })
            .collect();
        format!("<?xml version=\"1.0\"?>\n<feature_vector_file><comments></comments>{}</feature_vector_file>", body)
    }

    fn class_songs(prefix: &str, level: f64) -> Vec<(String, Vec<f64>)> {
        (0..6)
            .map(|i| (format!("{}{}.mid", prefix, i), vec![level + 0.1 * i as f64, 10.0 - level]))
            .collect()
    }

    fn output_config(root: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.paths.models_dir = root.join("models").display().to_string();
        config.paths.plots_dir = root.join("plot").display().to_string();
        config.paths.history_dir = root.join("history").display().to_string();
        config
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_features_run_and_predict() {
        let dir = tempfile::tempdir().unwrap();
        let names = ["Pitch_Variety", "Note_Density"];
        let rock = dir.path().join("rock.xml");
        let jazz = dir.path().join("jazz.xml");
        std::fs::write(&rock, feature_xml(&names, &class_songs("r", 1.0))).unwrap();
        std::fs::write(&jazz, feature_xml(&names, &class_songs("j", 5.0))).unwrap();

        let mut config = output_config(dir.path());
        config.features.tag = "t".to_string();
        config.features.seed = Some(3);
        config.features.classes = vec![
            FeatureClass { name: "rock".into(), path: rock.display().to_string() },
            FeatureClass { name: "jazz".into(), path: jazz.display().to_string() },
        ];
        config.dense = DenseConfig {
            hidden_layers: vec![4],
            rounds: 2,
            epochs_per_round: 1,
            batch_size: 4,
            ..DenseConfig::default()
        };
        config.validate_features().unwrap();

        let model = run_features(&config).unwrap();
        let file_name = model.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file_name.starts_with("dense_xml_t_") && file_name.ends_with(".bin"), "{}", file_name);

        let plots = files_in(Path::new(&config.paths.plots_dir));
        assert_eq!(plots.len(), 2);
        assert!(plots.iter().all(|p| p.starts_with("Testing_t_Dense_1layers4_0.6dropout_4batch_")));
        assert!(plots[0].ends_with(".html") && plots[1].ends_with(".png"));
        assert_eq!(files_in(Path::new(&config.paths.history_dir)).len(), 1);

        let checkpoint: Checkpoint<DenseParams, DenseConfig> = load_checkpoint(&model, ModelKind::Dense).unwrap();
        assert!(checkpoint.scaler.is_some());
        assert_eq!(checkpoint.feature_names, vec!["Pitch_Variety", "Note_Density"]);

        let predictions = predict_dense(&model, &rock).unwrap();
        assert_eq!(predictions.len(), 6);
        assert_eq!(predictions[0].song, "r0.mid");
        assert!(predictions.iter().all(|p| (p.class == "rock" || p.class == "jazz") && p.probability <= 1.0));
        assert!(run_predict(&model, &jazz).is_ok());

        let other = dir.path().join("other.xml");
        std::fs::write(&other, feature_xml(&["Totally_Other_Feature", "Unrelated"], &class_songs("o", 1.0))).unwrap();
        assert!(matches!(predict_dense(&model, &other), Err(TrainingError::DataProcessing(_))));
        let swapped = dir.path().join("swapped.xml");
        std::fs::write(&swapped, feature_xml(&["Note_Density", "Pitch_Variety"], &class_songs("s", 1.0))).unwrap();
        assert!(predict_dense(&model, &swapped).is_err());

        // a dense checkpoint is not a conv+LSTM model
        assert!(matches!(
            predict_conv_lstm(&model, dir.path()),
            Err(TrainingError::ModelConfiguration(_))
        ));
    }

    fn write_json_song(dir: &Path, name: &str, base_pitch: u8) {
        let track = |offset: u64| {
            Track::new(
                (0..6)
                    .map(|i| Note {
                        pitch: base_pitch + i as u8,
                        tick: offset + 10 * i,
                        duration: 5,
                    })
                    .collect(),
            )
        };
        let song = Song {
            name: name.to_string(),
            tracks: vec![track(0), track(0)],
        };
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(format!("{}.json", name)), serde_json::to_string(&song).unwrap()).unwrap();
    }

    #[test]
    fn test_sequences_run_and_predict() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = dir.path().join("dataset");
        for split in ["train", "test"] {
            for i in 0..2 {
                write_json_song(&corpus.join(split).join("low"), &format!("{}_low{}", split, i), 30);
                write_json_song(&corpus.join(split).join("high"), &format!("{}_high{}", split, i), 90);
            }
        }
        // too few tracks for a window
        std::fs::write(
            corpus.join("test").join("low").join("solo.json"),
            serde_json::to_string(&Song {
                name: "solo".into(),
                tracks: vec![Track::new(vec![Note { pitch: 1, tick: 0, duration: 1 }])],
            })
            .unwrap(),
        )
        .unwrap();

        let mut config = output_config(dir.path());
        config.sequences.tag = "t".to_string();
        config.sequences.corpus_dir = corpus.display().to_string();
        config.sequences.classes = vec!["low".into(), "high".into()];
        config.sequences.seed = Some(9);
        config.sequences.window = WindowConfig {
            n_tracks: 2,
            n_notes: 4,
            ..WindowConfig::default()
        };
        config.conv_lstm = ConvLstmConfig {
            conv_layers: vec![conv_lstm::ConvLayerConfig { filter_size: 2, num_filters: 2 }],
            lstm_hidden: 3,
            fc_hidden: 4,
            learning_rate: 0.01,
            iterations: 2,
            batch_size: 2,
            display_step: 1,
            ..ConvLstmConfig::default()
        };
        config.paths.checkpoint_format = crate::neural::storage::CheckpointFormat::Json;
        config.validate_sequences().unwrap();

        let model = run_sequences(&config).unwrap();
        let file_name = model.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file_name.starts_with("conv_lstm_t_") && file_name.ends_with(".json"), "{}", file_name);
        assert_eq!(checkpoint_kind(&model).unwrap(), ModelKind::ConvLstm);

        let plots = files_in(Path::new(&config.paths.plots_dir));
        assert!(plots.iter().all(|p| p.starts_with("Testing_t_ConvLstm_2iter_2batch_")));
        assert_eq!(plots.len(), 2);

        let predictions = predict_conv_lstm(&model, &corpus.join("test").join("low")).unwrap();
        let songs: Vec<&str> = predictions.iter().map(|p| p.song.as_str()).collect();
        assert_eq!(songs, vec!["test_low0", "test_low1"]);
        assert!(predictions.iter().all(|p| p.class == "low" || p.class == "high"));
        assert!(run_predict(&model, &corpus.join("train")).is_ok());

        assert!(matches!(
            predict_dense(&model, &corpus.join("missing.xml")),
            Err(TrainingError::ModelConfiguration(_))
        ));
    }
}
