use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use ocfl_index::backend::{self, ObjectListOptions, ObjectSort, StateQuery};
use ocfl_index::fs::LocalFs;
use ocfl_index::inventory::VNum;
use ocfl_index::layout;
use ocfl_index::scheduler::Scheduler;
use ocfl_index::{BuildInfo, Digest, Index, IndexMode, IndexOptions};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Whether to log in JSON
    #[arg(long)]
    json: bool,

    #[arg(long)]
    log_level: Option<Level>,

    /// Where the index is stored.
    #[arg(long, env, default_value = "redb:///var/lib/ocfl-index/index.redb")]
    index_addr: String,

    /// Path of the OCFL storage root.
    #[arg(long, env, default_value = ".")]
    storage_root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum SortArg {
    Id,
    V1Created,
    HeadCreated,
}

impl From<SortArg> for ObjectSort {
    fn from(value: SortArg) -> Self {
        match value {
            SortArg::Id => ObjectSort::Id,
            SortArg::V1Created => ObjectSort::V1Created,
            SortArg::HeadCreated => ObjectSort::HeadCreated,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Indexes the storage root, or only the given objects.
    Index {
        /// Object ids to index, resolved through the storage layout.
        #[arg(long = "id", value_name = "ID")]
        ids: Vec<String>,

        /// Object root paths to index, relative to the storage root.
        #[arg(long = "path", value_name = "PATH", conflicts_with = "ids")]
        paths: Vec<String>,

        /// Also record file sizes.
        #[arg(long)]
        with_sizes: bool,

        /// Number of inventories parsed concurrently.
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Lists indexed object roots.
    Roots {
        #[arg(long, default_value_t = 0)]
        limit: usize,

        #[arg(long, default_value = "")]
        cursor: String,
    },
    /// Lists indexed objects.
    Objects {
        #[arg(long, value_enum, default_value = "id")]
        sort: SortArg,

        #[arg(long)]
        desc: bool,

        #[arg(long, default_value_t = 0)]
        limit: usize,

        #[arg(long, default_value = "")]
        cursor: String,
    },
    /// Shows an object and its versions.
    Object {
        #[clap(value_name = "ID")]
        id: String,
    },
    /// Lists a directory in an object version.
    Ls {
        #[clap(value_name = "ID")]
        id: String,

        #[clap(value_name = "PATH", default_value = "")]
        path: String,

        /// Version to list, the head version if unset.
        #[arg(long)]
        version: Option<VNum>,

        /// List all files below the path.
        #[arg(long, short = 'r')]
        recursive: bool,

        #[arg(long, default_value_t = 0)]
        limit: usize,

        #[arg(long, default_value = "")]
        cursor: String,
    },
    /// Prints the contents of a stored file.
    Cat {
        #[clap(value_name = "DIGEST")]
        digest: String,
    },
    /// Shows counts of indexed data.
    Summary,
}

fn size(size: Option<u64>) -> String {
    size.map_or("-".to_string(), |s| s.to_string())
}

fn print_cursor(cursor: &str) {
    if !cursor.is_empty() {
        eprintln!("next cursor: {}", cursor);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // configure log settings
    let level = cli.log_level.unwrap_or(Level::INFO);

    let subscriber = tracing_subscriber::registry()
        .with(if cli.json {
            Some(
                tracing_subscriber::fmt::Layer::new()
                    .with_writer(io::stderr.with_max_level(level))
                    .json(),
            )
        } else {
            None
        })
        .with(if !cli.json {
            Some(
                tracing_subscriber::fmt::Layer::new()
                    .with_writer(io::stderr.with_max_level(level))
                    .pretty(),
            )
        } else {
            None
        });

    tracing::subscriber::set_global_default(subscriber).expect("Unable to set global subscriber");

    let fs = LocalFs::new(&cli.storage_root);
    let mut index = Index::new(
        backend::from_addr(&cli.index_addr).await?,
        Arc::new(fs.clone()),
        BuildInfo::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
    );
    if let Some(resolver) = layout::from_storage_root(&fs).await? {
        index = index.with_resolver(Arc::from(resolver));
    }

    match cli.command {
        Commands::Index {
            ids,
            paths,
            with_sizes,
            concurrency,
        } => {
            let mode = if !ids.is_empty() {
                IndexMode::ObjectIds(ids)
            } else if !paths.is_empty() {
                IndexMode::ObjectPaths(paths)
            } else {
                IndexMode::FullScan
            };
            let defaults = IndexOptions::default();
            let concurrency = concurrency.unwrap_or(defaults.concurrency);

            let scheduler = Scheduler::new();
            let mut session = scheduler.attach_monitor(CancellationToken::new()).await?;
            let printer = tokio::spawn(async move {
                loop {
                    match session.recv().await {
                        Ok(Some(line)) => println!("{}", line),
                        Ok(None) => break,
                        Err(e) => {
                            warn!(err=%e, "stopped printing progress");
                            break;
                        }
                    }
                }
            });

            let index = Arc::new(index);
            let task = scheduler.try_start("index", move |ctx| async move {
                index
                    .index(IndexOptions {
                        mode,
                        concurrency,
                        with_sizes,
                        progress: Some(ctx.progress),
                        cancel: ctx.cancel,
                    })
                    .await
            })?;

            let interrupted = {
                let cancel = task.cancel_token();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("interrupted, cancelling");
                        cancel.cancel();
                    }
                })
            };
            let result = task.wait().await;
            interrupted.abort();

            scheduler.close();
            printer.await?;
            let stats = result?;
            info!(%stats, "done");
        }
        Commands::Roots { limit, cursor } => {
            let list = index.list_object_roots(limit, &cursor).await?;
            for root in &list.roots {
                println!("{}\t{}", root.path, root.indexed_at.to_rfc3339());
            }
            print_cursor(&list.next_cursor);
        }
        Commands::Objects {
            sort,
            desc,
            limit,
            cursor,
        } => {
            let list = index
                .list_objects(&ObjectListOptions {
                    sort: sort.into(),
                    descending: desc,
                    limit,
                    cursor,
                })
                .await?;
            for object in &list.objects {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    object.ocfl_id,
                    object.spec,
                    object.head,
                    object.v1_created.map_or("-".to_string(), |t| t.to_rfc3339()),
                    object.head_created.map_or("-".to_string(), |t| t.to_rfc3339()),
                );
            }
            print_cursor(&list.next_cursor);
        }
        Commands::Object { id } => {
            let object = index.get_object(&id).await?;
            let inv = &object.inventory;
            println!("id:\t{}", inv.ocfl_id);
            println!("root:\t{}", inv.root_path);
            println!("spec:\t{}", inv.spec);
            println!("digest:\t{} {}", inv.digest_algorithm, inv.inventory_digest);
            println!("head:\t{}", inv.head);
            println!("indexed:\t{}", inv.indexed_at.to_rfc3339());
            for version in &object.versions {
                let user = version
                    .user
                    .as_ref()
                    .map_or("-".to_string(), |u| format!("{} <{}>", u.name, u.address));
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    version.num,
                    version.created.to_rfc3339(),
                    size(version.size),
                    user,
                    version.message,
                );
            }
        }
        Commands::Ls {
            id,
            path,
            version,
            recursive,
            limit,
            cursor,
        } => {
            let info = index
                .get_object_state(&StateQuery {
                    object_id: id,
                    version,
                    base_path: path.clone(),
                    recursive,
                    limit,
                    cursor,
                })
                .await?;
            if !info.is_dir {
                println!("-\t{}\t{}\t{}", size(info.size), info.digest, path);
            }
            for child in &info.children {
                println!(
                    "{}\t{}\t{}\t{}",
                    if child.is_dir { "d" } else { "-" },
                    size(child.size),
                    child.digest,
                    child.name,
                );
            }
            print_cursor(&info.next_cursor);
        }
        Commands::Cat { digest } => {
            let digest = Digest::from_hex(&digest)?;
            let mut r = index.open_content(&digest).await?;
            tokio::io::copy(&mut r, &mut tokio::io::stdout()).await?;
        }
        Commands::Summary => {
            let summary = index.summary().await?;
            let (major, minor) = index.schema_version().await?;
            println!("schema:\t{}.{}", major, minor);
            println!("object roots:\t{}", summary.object_roots);
            println!("inventories:\t{}", summary.inventories);
            println!("nodes:\t{}", summary.nodes);
            println!("names:\t{}", summary.names);
            println!("content paths:\t{}", summary.content_paths);
            println!(
                "last indexed:\t{}",
                summary
                    .indexed_at
                    .map_or("never".to_string(), |t| t.to_rfc3339())
            );
        }
    }

    Ok(())
}
