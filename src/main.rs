use anyhow::{Context, Result, bail};
use clap::Parser;
use pkgload::fetch::{DEFAULT_FETCH_TIMEOUT, HttpFetcher};
use pkgload::host::LibraryHost;
use pkgload::manager::ResolutionManager;
use pkgload::manifest::PackageManifest;
use pkgload::platform::PlatformId;
use pkgload::resolver::{ResolveOptions, default_download_dir};
use pkgload::tree::ModuleTree;
use pkgload::version::parse_version;
use std::path::PathBuf;
use std::sync::Arc;

/// pkgload - dependency-resolving module loader
///
/// Resolves a package and its transitive dependencies against the current
/// platform and loads the resulting modules into this process.
#[derive(Parser, Debug)]
#[command(author, version = env!("PKGLOAD_VERSION"), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Cache directory for fetched artifacts and bound modules
    /// (also via PKGLOAD_CACHE)
    #[arg(long = "cache", env = "PKGLOAD_CACHE", value_name = "PATH", global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Package registry base URL (also via PKGLOAD_REGISTRY)
    #[arg(
        long = "registry",
        env = "PKGLOAD_REGISTRY",
        value_name = "URL",
        default_value = "https://registry.pkgload.dev",
        global = true
    )]
    pub registry: String,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Resolve a package and load its module tree
    Resolve(ResolveArgs),

    /// Show the manifest of a package archive
    Show(ShowArgs),

    /// List packages registered from the given sources
    List(ListArgs),
}

#[derive(clap::Args, Debug)]
struct ResolveArgs {
    /// The package id to resolve
    #[arg(value_name = "ID")]
    pub id: String,

    /// Resolve this exact version instead of the highest registered one
    #[arg(long, value_name = "VERSION")]
    pub version: Option<String>,

    /// Local package source (archive file or directory); repeatable
    #[arg(long = "source", short = 's', value_name = "PATH")]
    pub sources: Vec<PathBuf>,

    /// Allow fetching missing packages from the registry
    #[arg(long)]
    pub fetch: bool,

    /// Target platform (defaults to the host platform)
    #[arg(long, value_name = "PLATFORM")]
    pub platform: Option<String>,

    /// Print the resolved tree as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(clap::Args, Debug)]
struct ShowArgs {
    /// Path to a package archive
    #[arg(value_name = "ARCHIVE")]
    pub archive: PathBuf,
}

#[derive(clap::Args, Debug)]
struct ListArgs {
    /// Local package source (archive file or directory); repeatable
    #[arg(long = "source", short = 's', value_name = "PATH", required = true)]
    pub sources: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // PKGLOAD_TRACE switches to span-aware tracing output; the default is
    // plain env_logger filtering on RUST_LOG.
    if std::env::var_os("PKGLOAD_TRACE").is_some() {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }
    let cli = Cli::parse();

    let cache_dir = cli.cache_dir.clone().unwrap_or_else(default_download_dir);

    match cli.command {
        Commands::Resolve(args) => resolve(&cli.registry, &cache_dir, args).await,
        Commands::Show(args) => show(&args.archive),
        Commands::List(args) => list(&args.sources),
    }
}

async fn resolve(registry: &str, cache_dir: &std::path::Path, args: ResolveArgs) -> Result<()> {
    let host = Arc::new(LibraryHost::new(cache_dir.join("bind")));
    let fetcher = HttpFetcher::new(registry, DEFAULT_FETCH_TIMEOUT)?;
    let mut manager = ResolutionManager::new(Arc::clone(&host), fetcher);
    manager.register_fallback_hook();

    for source in &args.sources {
        manager
            .register_source(source)
            .with_context(|| format!("Failed to register source {:?}", source))?;
    }

    let target = match &args.platform {
        Some(s) => s.parse::<PlatformId>()?,
        None => PlatformId::host(),
    };
    let version = args
        .version
        .as_deref()
        .map(parse_version)
        .transpose()?;

    let options = ResolveOptions {
        download_missing: args.fetch,
        download_dir: cache_dir.join("artifacts"),
        ..ResolveOptions::default()
    };

    let tree = manager
        .resolve_package(&args.id, version.as_ref(), &target, &options)
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&tree)?);
    } else {
        print_tree(&tree);
    }
    Ok(())
}

fn print_tree(tree: &ModuleTree) {
    tree.walk(&mut |node, depth| {
        let marker = if node.managed { "" } else { " (host)" };
        let modules = if node.modules.is_empty() {
            String::new()
        } else {
            format!(
                " [{}]",
                node.modules
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };
        println!(
            "{}{}@{}{}{}",
            "  ".repeat(depth),
            node.id,
            node.version,
            marker,
            modules
        );
    });
}

fn show(archive: &std::path::Path) -> Result<()> {
    let reader = pkgload::archive::ArchiveReaderImpl::new();
    let manifest = reader.read_manifest(archive)?;
    print_manifest(&manifest);
    Ok(())
}

fn print_manifest(manifest: &PackageManifest) {
    println!("{}@{}", manifest.id, manifest.version);
    if manifest.is_linking_package() {
        println!("  (linking package, no loadable code)");
    }
    for group in &manifest.dependency_groups {
        let platform = group
            .platform
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "any".to_string());
        println!("  dependencies ({platform}):");
        for dep in &group.dependencies {
            println!("    {} {}", dep.id, dep.range);
        }
    }
    for group in &manifest.file_groups {
        let platform = group
            .platform
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "any".to_string());
        println!("  files ({platform}):");
        for file in &group.files {
            println!("    {file}");
        }
    }
}

fn list(sources: &[PathBuf]) -> Result<()> {
    let mut catalog = pkgload::catalog::Catalog::new();
    for source in sources {
        let count = if source.is_dir() {
            catalog.register_dir(source)?
        } else {
            catalog.register_file(source).map(|_| 1)?
        };
        if count == 0 {
            bail!("No package archives found in {:?}", source);
        }
    }

    for entry in catalog.entries() {
        println!(
            "{}@{}  {:?}",
            entry.manifest.id, entry.manifest.version, entry.archive_path
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_resolve_parsing() {
        let cli = Cli::try_parse_from([
            "pkgload", "resolve", "acme.app", "--source", "/tmp/pkgs", "--fetch",
        ])
        .unwrap();
        match cli.command {
            Commands::Resolve(args) => {
                assert_eq!(args.id, "acme.app");
                assert_eq!(args.sources, vec![PathBuf::from("/tmp/pkgs")]);
                assert!(args.fetch);
                assert!(args.version.is_none());
            }
            _ => panic!("expected resolve command"),
        }
    }

    #[test]
    fn test_cli_show_parsing() {
        let cli = Cli::try_parse_from(["pkgload", "show", "acme.app.1.0.0.pkg"]).unwrap();
        match cli.command {
            Commands::Show(args) => {
                assert_eq!(args.archive, PathBuf::from("acme.app.1.0.0.pkg"));
            }
            _ => panic!("expected show command"),
        }
    }

    #[test]
    fn test_cli_list_requires_source() {
        assert!(Cli::try_parse_from(["pkgload", "list"]).is_err());
    }
}
