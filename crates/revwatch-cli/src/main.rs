use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use revwatch_core::{ArticleId, SubscriptionKey};
use revwatch_storage::PgReviewStore;
use revwatch_sync::{Engine, EngineConfig, ProductReport, SubscribeOutcome};
use tokio::time::Instant;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "revwatch")]
#[command(about = "Review Change Watcher command-line interface")]
struct Cli {
    /// YAML config file; defaults to ./revwatch.yaml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch current reviews for one product or a bracketed list `[a, b, c]`.
    Fetch { products: String },
    /// Start watching a product for new reviews.
    Subscribe {
        #[arg(long)]
        subscriber: String,
        product: String,
    },
    Unsubscribe {
        #[arg(long)]
        subscriber: String,
        product: String,
    },
    /// Poll every subscription once and exit.
    Sweep,
    /// Poll subscriptions on schedule until interrupted.
    Watch,
    /// Apply database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,revwatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("migrate needs database_url (or REVWATCH_DATABASE_URL)");
            };
            PgReviewStore::connect(url).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Fetch { products } => {
            let engine = Engine::from_config(config).await?;
            for report in engine.pipeline.fetch_products(&products, engine.store.as_ref()).await {
                print_report(&report);
            }
        }
        Commands::Subscribe { subscriber, product } => {
            let article = parse_article(&product)?;
            let engine = Engine::from_config(config).await?;
            match engine.scheduler().subscribe(&subscriber, &article).await? {
                SubscribeOutcome::Created { checkpoint } => {
                    println!("subscribed {subscriber} to {article}; reviews after {checkpoint} will be announced")
                }
                SubscribeOutcome::AlreadySubscribed => println!("{subscriber} already watches {article}"),
            }
        }
        Commands::Unsubscribe { subscriber, product } => {
            let key = SubscriptionKey {
                subscriber_id: subscriber,
                article_id: parse_article(&product)?,
            };
            let engine = Engine::from_config(config).await?;
            if engine.scheduler().unsubscribe(&key).await? {
                println!("unsubscribed {key}");
            } else {
                println!("no subscription {key}");
            }
        }
        Commands::Sweep => {
            let engine = Engine::from_config(config).await?;
            let scheduler = engine.scheduler();
            scheduler.load_from_store().await?;
            let summary = scheduler.sweep_at(Instant::now()).await;
            println!(
                "sweep complete: run_id={} jobs={} delivered={} no_news={} failed={}",
                summary.run_id, summary.ran, summary.delivered_reviews, summary.no_news, summary.failed
            );
        }
        Commands::Watch => {
            let engine = Engine::from_config(config).await?;
            let mut sched = engine.scheduler().start().await?;
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down");
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

fn parse_article(input: &str) -> Result<ArticleId> {
    ArticleId::from_input(input).with_context(|| format!("not a product id or link: {input}"))
}

fn print_report(report: &ProductReport) {
    match report {
        ProductReport::Fetched(fetched) => {
            let product = &fetched.product;
            println!(
                "{}: {} / {} ({} reviews)",
                product.article_id,
                product.brand,
                product.name,
                fetched.reviews.len()
            );
            for review in &fetched.reviews {
                println!(
                    "  {}  {}/5  {}: {}",
                    review.date, review.rating, review.author_name, review.text
                );
            }
        }
        ProductReport::NotFound { article } => println!("{article}: no data available for this product"),
        ProductReport::Failed { input, reason } => println!("{input}: unable to fetch reviews ({reason})"),
    }
}
