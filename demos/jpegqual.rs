//! Prints the quantization tables and the estimated IJG quality of JPEG files.
//!
//! Usage: `jpegqual [-s] [-t] [-c] [-u] [-i] <file.jpg>...`

use std::{env, fmt::Write as _, fs, process::ExitCode};

use anyhow::{bail, Context};
use file_jpeg::{
    estimate_quality, read_header, DetectedQuality, JpegHeader, QuantTable, Sampling,
};

const USAGE: &str = "usage: jpegqual [-s|--summary] [-t|--tables] [-c|--ctables] \
                     [-u|--unknown] [-i|--ignore-errors] <file.jpg>...";

#[derive(Default)]
struct Options {
    summary: bool,
    tables: bool,
    ctables: bool,
    unknown: bool,
    ignore_errors: bool,
}

fn main() -> anyhow::Result<ExitCode> {
    env_logger::init();

    let mut opts = Options::default();
    let mut files = Vec::new();
    for arg in env::args().skip(1) {
        match &*arg {
            "-s" | "--summary" => opts.summary = true,
            "-t" | "--tables" => opts.tables = true,
            "-c" | "--ctables" => opts.ctables = true,
            "-u" | "--unknown" => opts.unknown = true,
            "-i" | "--ignore-errors" => opts.ignore_errors = true,
            "-h" | "--help" => {
                println!("{USAGE}");
                return Ok(ExitCode::SUCCESS);
            }
            flag if flag.starts_with('-') => bail!("unknown option '{flag}'\n{USAGE}"),
            _ => files.push(arg),
        }
    }

    if files.is_empty() {
        bail!("Missing file name.  Try the option --help for help");
    }
    if !(opts.summary || opts.tables || opts.ctables || opts.unknown) {
        eprintln!("Missing output option.  Assuming that you wanted --summary.");
        opts.summary = true;
    }

    let mut unknown = Vec::new();
    for file in &files {
        match analyze(file, &opts) {
            Ok((header, quality)) => {
                if quality == DetectedQuality::Unknown {
                    unknown.push((file, header));
                }
            }
            Err(e) => {
                eprintln!("{e:#}");
                if !opts.ignore_errors {
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
    }

    if opts.unknown {
        for (file, header) in &unknown {
            print!("{}", ctables(file, header));
        }
        println!("/* TOTAL FILES: {} */", unknown.len());
    }

    Ok(ExitCode::SUCCESS)
}

fn analyze(file: &str, opts: &Options) -> anyhow::Result<(JpegHeader, DetectedQuality)> {
    let data = fs::read(file).with_context(|| format!("Cannot open '{file}'"))?;
    let header = read_header(&data).with_context(|| format!("'{file}'"))?;
    let quality = estimate_quality(&header.quant_tables, header.components.len());

    if opts.unknown {
        return Ok((header, quality));
    }
    if opts.summary {
        print!("{}", summary(file, &header, quality));
    }
    if opts.ctables {
        print!("{}", ctables(file, &header));
    }
    if opts.tables {
        let slots = header.quant_tables.slots();
        print!("{}", two_columns(0, slots[0].as_ref(), 1, slots[1].as_ref()));
        if slots[2].is_some() || slots[3].is_some() {
            print!("{}", two_columns(2, slots[2].as_ref(), 3, slots[3].as_ref()));
        }
    }
    Ok((header, quality))
}

fn summary(file: &str, header: &JpegHeader, quality: DetectedQuality) -> String {
    let mut out = format!("{file}:\n");
    match quality {
        DetectedQuality::Exact(q) => writeln!(out, "\tQuality:  {q:02} (exact)"),
        DetectedQuality::Approximate(q) => writeln!(out, "\tQuality:  {q:02} (approx)"),
        DetectedQuality::Unknown => writeln!(out, "\tQuality:  unknown"),
    }
    .ok();

    let factors = header
        .components
        .iter()
        .map(|c| format!("{}x{}", c.sampling.h, c.sampling.v))
        .collect::<Vec<_>>();
    // Chroma factors of plain 1x1 are only listed for unusual layouts.
    let chroma_is_plain = factors.len() == 3
        && header.components[1..]
            .iter()
            .all(|c| c.sampling == Sampling::ONE);
    let shown = if chroma_is_plain || factors.len() == 1 {
        &factors[..1]
    } else {
        &factors[..]
    };
    writeln!(out, "\tSampling: {}", shown.join(",")).ok();
    writeln!(out, "\tQ.tables: {}", header.quant_tables.count()).ok();
    out
}

/// Dumps the tables as a C initializer, ready to paste into a table of known encoders.
fn ctables(file: &str, header: &JpegHeader) -> String {
    let luma = header.components.first().map_or(Sampling::ONE, |c| c.sampling);
    let mut out = format!(
        "  {{\n    /* {file} */\n    \"?\", \"?\",\n    {}, {},\n    {},\n",
        luma.h,
        luma.v,
        header.quant_tables.count()
    );
    let slots = header.quant_tables.slots();
    for (id, table) in slots.iter().enumerate() {
        let Some(table) = table else { continue };
        let more = slots[id + 1..].first().map_or(false, Option::is_some);
        out.push_str(&ctable(id, table, more));
    }
    out.push_str("  },\n");
    out
}

fn ctable(id: usize, table: &QuantTable, more: bool) -> String {
    let mut out = format!("    {{  /* table {id} */\n      ");
    for (i, v) in table.values.iter().enumerate() {
        if i == 63 {
            writeln!(out, "{v:3}").ok();
        } else if (i + 1) % 8 == 0 {
            write!(out, "{v:3},\n      ").ok();
        } else {
            write!(out, "{v:3}, ").ok();
        }
    }
    out.push_str(if more { "    },\n" } else { "    }\n" });
    out
}

fn two_columns(
    id1: usize,
    table1: Option<&QuantTable>,
    id2: usize,
    table2: Option<&QuantTable>,
) -> String {
    let Some(table1) = table1 else {
        return String::new();
    };
    let mut out = match table2 {
        Some(_) => {
            format!("\tQuantization table {id1}:              Quantization table {id2}:\n")
        }
        None => format!("\tQuantization table {id1}:\n"),
    };
    for (row, left) in table1.rows().enumerate() {
        out.push('\t');
        for v in left {
            write!(out, "{v:3} ").ok();
        }
        if let Some(table2) = table2 {
            out.push_str(" | ");
            for v in &table2.values[row * 8..row * 8 + 8] {
                write!(out, "{v:3} ").ok();
            }
        }
        out.truncate(out.trim_end().len());
        out.push('\n');
    }
    out
}
