//! Main entry point for the partar CLI app.

use std::path::PathBuf;

use partar::cli::{self, Commands};
use partar::common::ArchiveOpts;
use partar::error::ArchiveError;
use partar::flist::FileList;
use partar::{comm, create, extract};

fn main() -> std::process::ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = run_app() {
        if e.downcast_ref::<clap::Error>().is_none() {
            eprintln!("Error: {}", e);
        }
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

fn run_app() -> Result<(), Box<dyn std::error::Error>> {
    let command = cli::run()?;

    match command {
        Commands::Create { inputs, output, directory, preserve, chunk_size, block_size, ranks } => {
            let cwd = match directory {
                Some(dir) => absolutize(dir)?,
                None => std::env::current_dir()?,
            };
            let inputs: Vec<PathBuf> = inputs
                .into_iter()
                .map(|p| if p.is_absolute() { p } else { cwd.join(p) })
                .collect();
            let output = absolutize(output)?;
            let opts = ArchiveOpts { preserve, chunk_size, block_size };
            let ranks = auto_ranks(ranks);

            let results = comm::spawn(ranks, |group| -> Result<(), ArchiveError> {
                create::check_destination(&group, &inputs, &output)?;
                let walked = if group.rank() == 0 {
                    FileList::walk(&inputs)
                } else {
                    Ok(FileList::default())
                };
                let list = match (group.all_true(walked.is_ok()), walked) {
                    (true, Ok(list)) => list,
                    (_, Err(err)) => return Err(err),
                    (false, Ok(_)) => return Err(ArchiveError::Failed("file list walk failed")),
                };
                create::create(&group, list, &output, &cwd, &opts)
            });
            for result in results {
                result?;
            }
        }
        Commands::Extract { archive, directory, preserve, block_size, ranks } => {
            let archive = absolutize(archive)?;
            let dest = match directory {
                Some(dir) => absolutize(dir)?,
                None => std::env::current_dir()?,
            };
            let opts = ArchiveOpts { preserve, block_size, ..Default::default() };
            let ranks = auto_ranks(ranks);

            let results =
                comm::spawn(ranks, |group| extract::extract(&group, &archive, &dest, &opts));
            for result in results {
                result?;
            }
        }
        Commands::List { archive } => {
            extract::list(&archive)?;
        }
    }

    Ok(())
}

fn auto_ranks(ranks: usize) -> usize {
    if ranks == 0 {
        num_cpus::get()
    } else {
        ranks
    }
}

fn absolutize(path: PathBuf) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
