use clap::Parser;
use hoi::{DetrHoiToolkit, HoiConfig, RunMode, RunOutcome, VisualRelation};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hoi", about = "HOI Relation Extraction Model", rename_all = "snake_case")]
struct Cli {
    #[command(flatten)]
    config: HoiConfig,
    /// train, eval or single; `--eval` selects eval when unset
    #[arg(long, value_enum)]
    mode: Option<RunMode>,
    #[arg(long, default_value = "hoi")]
    name: String,
    /// Read rank and world size from the launcher environment
    #[arg(long)]
    distributed: bool,
    #[arg(long, default_value_t = hoi::detr_hoi::DEFAULT_IMAGE_SIZE)]
    image_size: usize,
}

#[cfg(not(feature = "tch"))]
mod backend {
    use burn::backend::{ndarray::NdArrayDevice, Autodiff, NdArray};
    use hoi::config::DeviceKind;

    pub type Backend = Autodiff<NdArray<f32>>;

    pub fn device(kind: DeviceKind) -> anyhow::Result<NdArrayDevice> {
        match kind {
            DeviceKind::Cpu => Ok(NdArrayDevice::Cpu),
            other => anyhow::bail!("device {other:?} needs the `tch` feature, use `--device cpu`"),
        }
    }
}

#[cfg(feature = "tch")]
mod backend {
    use burn::backend::{libtorch::LibTorchDevice, Autodiff, LibTorch};
    use hoi::config::DeviceKind;

    pub type Backend = Autodiff<LibTorch<f32>>;

    pub fn device(kind: DeviceKind) -> anyhow::Result<LibTorchDevice> {
        Ok(match kind {
            DeviceKind::Cpu => LibTorchDevice::Cpu,
            DeviceKind::Cuda(index) => LibTorchDevice::Cuda(index),
            DeviceKind::Mps => LibTorchDevice::Mps,
        })
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    cli.config.validate()?;
    let mode = cli.mode.unwrap_or(if cli.config.eval { RunMode::Eval } else { RunMode::Train });
    let device = backend::device(cli.config.device_kind()?)?;

    let mut relation = VisualRelation::<backend::Backend, _>::new(
        cli.name,
        cli.distributed,
        cli.config,
        DetrHoiToolkit::new(cli.image_size),
        device,
    )?;

    match relation.run(mode)? {
        RunOutcome::Trained(summary) => info!(
            "finished {} epochs, best mAP {:?}",
            summary.epochs_run,
            summary.best.and_then(|best| best.best_map())
        ),
        RunOutcome::Evaluated(stats) => info!("{}", serde_json::to_string(&stats)?),
    }
    Ok(())
}
