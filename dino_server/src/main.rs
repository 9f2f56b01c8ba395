use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::get;
use axum_prometheus::PrometheusMetricLayer;
use clap::Parser;
use dino_server::backbone::BackboneSource;
use dino_server::config::{CacheModelArgs, Cli, Command, ExportArgs, FetchArgs, InvokeArgs, ServeArgs};
use dino_server::fetch::WeightFetcher;
use dino_server::image_io::{encode_base64, encode_bytes_base64};
use dino_server::server::{router, AppState};
use dino_server::InferenceRequest;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use tracing::{info, Level};

async fn serve(args: ServeArgs) -> Result<()> {
    let service = Arc::new(args.model.service());
    if !args.lazy {
        // Configuration problems abort startup instead of surfacing per request.
        service.initialize().await.context("model initialization failed")?;
    }

    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
    let state = AppState {
        service,
        variant: args.model.variant,
    };
    let app = router(state)
        .route("/metrics", get(move || std::future::ready(metric_handle.render())))
        .layer(prometheus_layer);

    info!("server listening on http://{}", args.bind);
    axum::serve(tokio::net::TcpListener::bind(args.bind).await?, app).await?;
    Ok(())
}

async fn invoke(args: InvokeArgs) -> Result<()> {
    let image = match &args.image {
        Some(path) => {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            encode_bytes_base64(&bytes)
        }
        None => {
            let red = RgbImage::from_pixel(224, 224, Rgb([255, 0, 0]));
            encode_base64(&DynamicImage::ImageRgb8(red), ImageFormat::Jpeg)?
        }
    };
    let service = args.model.service();
    let response = service.handle(InferenceRequest::with_image(image)).await;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn fetch_weights(args: FetchArgs) -> Result<()> {
    let dir = args.r2.fetch(&args.dir).await?;
    info!("weights available in {}", dir.display());
    Ok(())
}

async fn cache_model(args: CacheModelArgs) -> Result<()> {
    let source = BackboneSource::Hub {
        repo: args.model_repo,
        file: args.model_file,
    };
    let path = tokio::task::spawn_blocking(move || source.resolve()).await??;
    info!("backbone cached at {}", path.display());
    Ok(())
}

async fn export_weights(args: ExportArgs) -> Result<()> {
    let model = args.model.factory().build_finetuned().await?;
    let dir = model.save_finetune_weights(&args.out)?;
    info!("fine-tune weights written to {}", dir.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
        Command::Invoke(args) => invoke(args).await,
        Command::FetchWeights(args) => fetch_weights(args).await,
        Command::CacheModel(args) => cache_model(args).await,
        Command::ExportWeights(args) => export_weights(args).await,
    }
}
