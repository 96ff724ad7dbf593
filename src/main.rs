use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;

use asdf_rs::file::{AsdfFile, ASDF_VERSION};
use asdf_rs::{compression, extension, AsdfConfig};

#[derive(Parser)]
#[command(name = "asdf", version = ASDF_VERSION, about = "The ASDF container format CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the header line and a summary of every block
    Info {
        input: PathBuf,
    },
    /// Edit the YAML header in $EDITOR, then update the file in place
    Edit {
        input: PathBuf,
        /// Validate and show the result without writing anything back
        #[arg(long)]
        dry_run: bool,
    },
    /// List registered extensions (converters and compressors)
    Extensions,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match Cli::parse().command {
        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input } => {
            let af = AsdfFile::open(&input, AsdfConfig::default())?;
            println!("── ASDF file ────────────────────────────────────────────");
            println!("  Path            {}", input.display());
            println!("  File size       {} B", std::fs::metadata(&input)?.len());
            println!("  Format version  {}", af.version());
            println!(
                "  Standard        {}",
                af.standard_version().unwrap_or("(not recorded)")
            );
            let viewer = af.block_viewer();
            println!("  Blocks          {}", viewer.len());
            for line in viewer.info_lines()? {
                println!("  {line}");
            }
        }

        // ── Edit ─────────────────────────────────────────────────────────────
        Commands::Edit { input, dry_run } => {
            let mut af = AsdfFile::open_rw(&input, AsdfConfig::default())?;

            // Hand the YAML document to $EDITOR via a scratch file.
            let doc = edit_document(&mut af)?;
            let value: serde_yaml::Value = serde_yaml::from_slice(&doc)?;
            let manager = af.manager();
            let tree = asdf_rs::tree::yaml_to_node(&value, manager, &|uri| {
                Err(asdf_rs::AsdfError::Validation(format!(
                    "external reference {uri} can not be edited in place"
                )))
            })?;
            af.set_tree(tree);

            if dry_run {
                println!("Edited tree validates; file left untouched (--dry-run).");
            } else {
                af.update()?;
                println!("Updated: {}", input.display());
            }
        }

        // ── Extensions ───────────────────────────────────────────────────────
        Commands::Extensions => {
            let converters = extension::converter_tags();
            let compressors = compression::extension_labels();
            println!("Converters ({}):", converters.len());
            for tag in converters {
                println!("  !{tag}");
            }
            println!("Compressors ({}):", compressors.len());
            for label in compressors {
                println!("  {label}");
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

/// Serialize the tree, open it in `$EDITOR`, and return the edited bytes.
fn edit_document(af: &mut AsdfFile) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let config = af.config().clone();
    let tree = af.tree().clone();
    let value = {
        let manager = af.manager();
        // Serializing allocates write slots; they are cleared below before
        // the real update runs.
        let value = asdf_rs::tree::node_to_yaml(&tree, manager, &config)?;
        manager.clear_write_state();
        value
    };
    let body = serde_yaml::to_string(&value)?;

    let mut scratch = tempfile::Builder::new().suffix(".yaml").tempfile()?;
    scratch.write_all(body.as_bytes())?;
    scratch.flush()?;

    let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
    let status = Command::new(&editor).arg(scratch.path()).status()?;
    if !status.success() {
        return Err(format!("editor {editor} exited with {status}").into());
    }
    Ok(std::fs::read(scratch.path())?)
}
