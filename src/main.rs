/*
sfmap, to encode and flash sparse images: main module
Copyright (C) 2024-present Guoxin "7Ji" Pu

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as
published by the Free Software Foundation, either version 3 of the
License, or (at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

use std::{path::{Path, PathBuf}, process::ExitCode};

use clap::Parser;

mod blank;
mod chunk;
mod error;
mod pretty;
mod progress;
mod replay;
mod sfmap;

use error::{Error, Result};

#[derive(clap::Subcommand, Debug, Clone)]
enum Action {
    /// Create a blank image
    Blank {
        /// Size of the image in MiB
        size: u64,
        /// Path of the image to create, truncated if exists
        output: PathBuf,
    },
    /// Create an SFMap from an image
    Encode {
        /// Path of the raw image
        image: PathBuf,
        /// Path of the SFMap to write, defaults to the image path with
        /// .sfmap appended
        output: Option<PathBuf>,
        #[arg(short = 'l', long, default_value_t = 1,
            value_parser = clap::value_parser!(u32).range(0..=9))]
        /// gzip compression level
        level: u32,
    },
    /// Flash an SFMap
    Flash {
        /// Path of the SFMap to read
        sfmap: PathBuf,
        /// Path of the existing file or block device to write onto
        device: PathBuf,
        #[arg(short = 'q', long, default_value_t = 1000,
            value_parser = clap::value_parser!(u32).range(1..))]
        /// Records the decoder may run ahead of the writer
        queue: u32,
        #[arg(long)]
        /// Do not open the device with O_SYNC, only sync once at the end
        no_osync: bool,
    },
    /// Summarize an SFMap without flashing it
    Inspect {
        /// Path of the SFMap to read
        sfmap: PathBuf,
    },
}

#[derive(Parser, Debug)]
#[command(version, about = "Accelerated image flashing utility")]
struct Arg {
    #[command(subcommand)]
    action: Action,
}

fn default_output(image: &Path) -> PathBuf {
    let mut output = image.as_os_str().to_owned();
    output.push(".sfmap");
    output.into()
}

fn encode(image: &Path, output: Option<PathBuf>, level: u32) -> Result<()> {
    let output = output.unwrap_or_else(|| default_output(image));
    let summary = sfmap::encode_file(image, output,
        sfmap::EncodeOptions { level })?;
    summary.print_table_stdout()
}

fn flash(sfmap: &Path, device: &Path, queue: u32, no_osync: bool)
    -> Result<ExitCode>
{
    let options = replay::FlashOptions {
        queue_depth: queue as usize,
        sync_writes: !no_osync,
    };
    let report = replay::flash_file(sfmap, device, options)?;
    if report.synced {
        Ok(ExitCode::SUCCESS)
    } else {
        log::error!("Final sync of '{}' failed, written data may not be \
            durable", device.display());
        Ok(ExitCode::FAILURE)
    }
}

fn inspect(sfmap: &Path) -> Result<()> {
    let inspection = sfmap::inspect_file(sfmap)?;
    inspection.print_table_stdout()
}

fn run(action: Action) -> Result<ExitCode> {
    match action {
        Action::Blank { size, output } =>
            blank::create(output, size).map(|_| ExitCode::SUCCESS),
        Action::Encode { image, output, level } =>
            encode(&image, output, level).map(|_| ExitCode::SUCCESS),
        Action::Flash { sfmap, device, queue, no_osync } =>
            flash(&sfmap, &device, queue, no_osync),
        Action::Inspect { sfmap } =>
            inspect(&sfmap).map(|_| ExitCode::SUCCESS),
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let arg = Arg::parse();
    match run(arg.action) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
