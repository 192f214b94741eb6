use anyhow::{bail, Context, Result};
use clap::Parser;
use rcdc_core::{Operator, PipelineSpec, Sink, SinkSpec, Source, SourceSpec};
use rcdc_io::{sink_stdout::StdoutSink, source_cdc::CdcSource};
use std::path::PathBuf;
use tokio::{signal, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
struct Args {
    /// Pipeline YAML
    #[arg(short, long)]
    pipeline: PathBuf,
    /// Bounded channel capacity between operators
    #[arg(long, default_value_t = 8)]
    channel_capacity: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();
    let args = Args::parse();
    let spec: PipelineSpec = {
        let y = std::fs::read_to_string(&args.pipeline)
            .with_context(|| format!("read {}", args.pipeline.display()))?;
        PipelineSpec::from_yaml(&y)?
    };
    info!(pipeline = %spec.name, "pipeline loaded");

    // single source -> single sink
    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel(args.channel_capacity);

    let mut source = match spec.sources.first() {
        Some(SourceSpec::Cdc(cfg)) => CdcSource::try_new(cfg.clone())?,
        None => bail!("pipeline {} has no sources", spec.name),
    };
    let schema = source.schema();
    let mut sink: Box<dyn Sink> = match spec.sinks.first() {
        Some(SinkSpec::Stdout { id }) => Box::new(StdoutSink::new(id.clone(), schema)),
        None => bail!("pipeline {} has no sinks", spec.name),
    };

    let c1 = cancel.child_token();
    let mut src_handle = tokio::spawn(async move { source.run(tx, c1).await });
    let c2 = cancel.child_token();
    let sink_handle = tokio::spawn(async move { sink.run(rx, c2).await });

    // Ctrl-C handling
    let src_result = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            cancel.cancel();
            (&mut src_handle).await
        }
        finished = &mut src_handle => finished,
    };

    // Join
    src_result??;
    sink_handle.await??;
    Ok(())
}
