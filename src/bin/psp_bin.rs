// SPDX-License-Identifier: MIT

use clap::Parser;
use std::fs;
use std::process::ExitCode;
use trustrom::amd::psp_binary::{PspBinary, PSP_BINARY_HEADER_SIZE};

/// Decode PSP binary headers, one record per file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Files to read
    #[arg(required = true, index = 1)]
    files: Vec<String>,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    let mut failures = 0usize;

    for file in &args.files {
        let data = match fs::read(file) {
            Ok(data) => data,
            Err(e) => {
                eprintln!("{}: {}", file, e);
                failures += 1;
                continue;
            }
        };
        if data.len() < PSP_BINARY_HEADER_SIZE {
            println!("{:50} too small for a header ({} B)", file, data.len());
            continue;
        }
        match PspBinary::parse(&data) {
            Ok(binary) => println!("{:50} {}", file, binary.header()),
            Err(e) => {
                eprintln!("{}: {}", file, e);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
