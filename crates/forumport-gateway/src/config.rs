//! Gateway configuration.

use std::path::PathBuf;

use clap::Parser;
use forumport_core::idmap::IMPORT_LOG_TREE;

/// Forumport redirect gateway command line arguments.
#[derive(Debug, Parser)]
#[command(name = "forumport-gateway")]
#[command(about = "Redirects legacy forum URLs to imported content")]
pub struct Args {
    /// Address to listen on for HTTP requests.
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Data directory written by the importer.
    #[arg(short, long, default_value = "./forumport-data")]
    pub data_dir: PathBuf,

    /// Name of the import table holding the translations.
    #[arg(long, default_value = IMPORT_LOG_TREE)]
    pub import_table: String,

    /// Base URL of the target board; empty for root-relative redirects.
    #[arg(long, default_value = "")]
    pub base_url: String,

    /// Answer every unknown path with 404 instead of resolving legacy URLs.
    #[arg(long)]
    pub disable_redirects: bool,
}

/// Gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Address to listen on for HTTP requests.
    pub listen_addr: String,
    /// Data directory written by the importer.
    pub data_dir: PathBuf,
    /// Import table holding the translations.
    pub import_table: String,
    /// Base URL of canonical links.
    pub base_url: String,
    /// Whether legacy URLs are resolved at all.
    pub redirects_enabled: bool,
}

impl GatewayConfig {
    pub fn with_import_table(mut self, name: impl Into<String>) -> Self {
        self.import_table = name.into();
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_redirects(mut self, enabled: bool) -> Self {
        self.redirects_enabled = enabled;
        self
    }
}

impl From<&Args> for GatewayConfig {
    fn from(args: &Args) -> Self {
        Self {
            listen_addr: args.listen.clone(),
            data_dir: args.data_dir.clone(),
            import_table: args.import_table.clone(),
            base_url: args.base_url.clone(),
            redirects_enabled: !args.disable_redirects,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            data_dir: PathBuf::from("./forumport-data"),
            import_table: IMPORT_LOG_TREE.to_string(),
            base_url: String::new(),
            redirects_enabled: true,
        }
    }
}
