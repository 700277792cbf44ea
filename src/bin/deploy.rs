//! Standalone deployment CLI.
//!
//! Thin driver over the library: parse arguments, load the blobs into a
//! parameter struct, run the platform pipeline. All real work and all
//! format knowledge lives in the library modules.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::error;

use standalone_deploy::elf::{deploy_android, deploy_linux};
use standalone_deploy::pe::deploy_windows;
use standalone_deploy::sign::sign_windows;
use standalone_deploy::{DeployParams, DeployResult, SignParams};

#[derive(Parser)]
#[command(name = "deploy")]
#[command(about = "Patch precompiled engine templates into standalone executables")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct DeployArgs {
    /// Precompiled engine template to patch
    #[arg(value_name = "ENGINE")]
    engine: PathBuf,

    /// Output executable path
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,

    /// Serialized project data to embed
    #[arg(short, long, value_name = "FILE")]
    project: Option<PathBuf>,

    /// Payload blob to embed ahead of the project data
    #[arg(long, value_name = "FILE")]
    payload: Option<PathBuf>,
}

#[derive(clap::Args)]
struct WindowsResourceArgs {
    /// Application icon (.ico)
    #[arg(long, value_name = "FILE")]
    app_icon: Option<PathBuf>,

    /// Document icon (.ico)
    #[arg(long, value_name = "FILE")]
    doc_icon: Option<PathBuf>,

    /// Version-info entry, repeatable (KEY=VALUE)
    #[arg(long = "version-info", value_name = "KEY=VALUE")]
    version_info: Vec<String>,

    /// Manifest XML file
    #[arg(long, value_name = "FILE")]
    manifest: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Patch a desktop Linux engine
    Linux {
        #[command(flatten)]
        common: DeployArgs,
    },
    /// Patch an Android engine
    Android {
        #[command(flatten)]
        common: DeployArgs,
    },
    /// Patch a Windows engine, optionally updating its resources
    Windows {
        #[command(flatten)]
        common: DeployArgs,
        #[command(flatten)]
        resources: WindowsResourceArgs,
    },
    /// Authenticode-sign a patched Windows executable in place
    Sign {
        /// The PE file to sign
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// PKCS7/SPC certificate container
        #[arg(short, long, value_name = "FILE")]
        certificate: PathBuf,

        /// Private key (PVK or PKCS12)
        #[arg(short = 'k', long, value_name = "FILE")]
        private_key: PathBuf,

        /// Key passphrase
        #[arg(short = 'p', long, value_name = "PASSPHRASE")]
        passphrase: Option<String>,

        /// Timestamp authority URL
        #[arg(short, long, value_name = "URL")]
        timestamper: Option<String>,

        /// Program description embedded in the signature
        #[arg(short, long, value_name = "TEXT")]
        description: Option<String>,

        /// Publisher URL embedded in the signature
        #[arg(short = 'u', long, value_name = "URL")]
        url: Option<String>,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Linux { common } => {
            deploy_params(&common, None).and_then(|params| deploy_linux(&params))
        }
        Commands::Android { common } => {
            deploy_params(&common, None).and_then(|params| deploy_android(&params))
        }
        Commands::Windows { common, resources } => deploy_params(&common, Some(resources))
            .and_then(|params| deploy_windows(&params)),
        Commands::Sign {
            input,
            certificate,
            private_key,
            passphrase,
            timestamper,
            description,
            url,
        } => sign_windows(&SignParams {
            input,
            certificate,
            private_key,
            passphrase,
            timestamper,
            description,
            url,
        }),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn deploy_params(
    args: &DeployArgs,
    resources: Option<WindowsResourceArgs>,
) -> DeployResult<DeployParams> {
    let project = match &args.project {
        Some(path) => Some(fs::read(path)?),
        None => None,
    };
    let payload = match &args.payload {
        Some(path) => Some(fs::read(path)?),
        None => None,
    };

    let mut params = DeployParams {
        engine: args.engine.clone(),
        output: args.output.clone(),
        project,
        payload,
        ..Default::default()
    };

    if let Some(resources) = resources {
        params.app_icon = resources.app_icon;
        params.doc_icon = resources.doc_icon;
        params.manifest = resources.manifest;
        params.version_info = resources
            .version_info
            .iter()
            .map(|entry| match entry.split_once('=') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (entry.clone(), String::new()),
            })
            .collect();
    }
    Ok(params)
}
