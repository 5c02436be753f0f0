// SPDX-License-Identifier: MIT

use clap::Parser;
use std::fs;
use std::process::ExitCode;
use trustrom::amd::directory::DirectoryLevel;
use trustrom::amd::trust::{get_keys, validate_psp_entries, validate_rtm};
use trustrom::amd::{parse_psp_firmware, PspFirmware};
use trustrom::{FirmwareImage, MappedImage};

/// Firmware trust-structure analysis tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Print the parsed structures
    #[arg(required = false, short, long)]
    print: bool,

    /// Print verbosely
    #[arg(required = false, short, long)]
    verbose: bool,

    /// Print as JSON
    #[arg(required = false, short, long)]
    json: bool,

    /// Walk the key chain and verify signed entries and the RTM volume
    #[arg(required = false, short = 'V', long)]
    verify: bool,

    /// Custom physical base address of the image, e.g. 0xff000000
    #[arg(long, value_parser = parse_hex)]
    base: Option<u64>,

    /// Image to read
    #[arg(index = 1)]
    file: String,
}

fn parse_hex(s: &str) -> Result<u64, String> {
    let trimmed = s.trim_start_matches("0x");
    u64::from_str_radix(trimmed, 16).map_err(|e| e.to_string())
}

fn print_firmware(fw: &PspFirmware, image: &dyn FirmwareImage, verbose: bool) {
    println!("{}", fw.efs);
    println!();
    println!(": Directories :");
    for (name, dir, range) in [
        ("PSP level 1", &fw.psp_level1, &fw.psp_level1_range),
        ("PSP level 2", &fw.psp_level2, &fw.psp_level2_range),
    ] {
        match dir {
            Some(dir) => {
                let at = range.map(|r| r.offset).unwrap_or(0);
                println!();
                println!("== {} @ {:08x}: {}", name, at, dir);
                for entry in &dir.entries {
                    println!("- {}", entry);
                }
            }
            None => println!("no {} directory", name),
        }
    }
    for (name, dir, range) in [
        ("BIOS level 1", &fw.bios_level1, &fw.bios_level1_range),
        ("BIOS level 2", &fw.bios_level2, &fw.bios_level2_range),
    ] {
        match dir {
            Some(dir) => {
                let at = range.map(|r| r.offset).unwrap_or(0);
                println!();
                println!("== {} @ {:08x}: {}", name, at, dir);
                for entry in &dir.entries {
                    println!("- {}", entry);
                }
            }
            None => println!("no {} directory", name),
        }
    }
    if verbose {
        println!();
        println!(
            ": Image : {} B, EFS @ {:08x}",
            image.data().len(),
            fw.efs_range.offset
        );
    }
}

fn verify(image: &dyn FirmwareImage, fw: &PspFirmware) -> Result<(), String> {
    let psp_level = if fw.psp_level2.is_some() {
        DirectoryLevel::Level2
    } else {
        DirectoryLevel::Level1
    };
    let bios_level = if fw.bios_level2.is_some() {
        DirectoryLevel::Level2
    } else {
        DirectoryLevel::Level1
    };

    let keys = get_keys(image, fw, psp_level).map_err(|e| e.to_string())?;
    println!(": Key chain :");
    print!("{}", keys);

    let mut failures = 0usize;
    println!();
    println!(": Signed entries ({}) :", psp_level);
    let results =
        validate_psp_entries(image, fw, psp_level, &keys).map_err(|e| e.to_string())?;
    for result in &results {
        println!("- {}", result);
        if !result.is_valid() {
            failures += 1;
        }
    }

    println!();
    match validate_rtm(image, fw, bios_level, &keys) {
        Ok(rtm) => {
            println!("{}", rtm);
            if !rtm.is_valid() {
                failures += 1;
            }
        }
        Err(e) => {
            println!("RTM volume not validated: {}", e);
            failures += 1;
        }
    }

    if failures > 0 {
        Err(format!("{} signature failures", failures))
    } else {
        Ok(())
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let data = match fs::read(&args.file) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("{}: {}", args.file, e);
            return ExitCode::FAILURE;
        }
    };
    let image = match args.base {
        Some(base) => MappedImage::with_base(&data, base),
        None => MappedImage::new(&data),
    };

    let fw = match parse_psp_firmware(&image) {
        Ok(fw) => fw,
        Err(e) => {
            eprintln!("{}: {}", args.file, e);
            return ExitCode::FAILURE;
        }
    };

    if args.json {
        match serde_json::to_string_pretty(&fw) {
            Ok(j) => println!("{}", j),
            Err(e) => {
                eprintln!("{}: {}", args.file, e);
                return ExitCode::FAILURE;
            }
        }
    } else if args.print || args.verbose || !args.verify {
        print_firmware(&fw, &image, args.verbose);
    }

    if args.verify {
        if let Err(e) = verify(&image, &fw) {
            eprintln!("{}: {}", args.file, e);
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}
