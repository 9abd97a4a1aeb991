use clap::{Arg, ArgAction, Command};
use std::io::{self, Write};

fn main() -> anyhow::Result<()> {
    let matches = Command::new("gen")
        .about("Write a synthetic product CSV to stdout")
        .arg(
            Arg::new("rows")
                .long("rows")
                .value_parser(clap::value_parser!(u64))
                .required(true),
        )
        .arg(
            Arg::new("no_header")
                .long("no-header")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("extra_cols")
                .long("extra-cols")
                .help("Additional attribute columns per row")
                .value_parser(clap::value_parser!(usize))
                .default_value("0"),
        )
        .arg(
            Arg::new("dup_every")
                .long("dup-every")
                .help("Every Nth row repeats the previous SKU in lower case")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("bad_every")
                .long("bad-every")
                .help("Every Nth row has an empty SKU")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("blank_every")
                .long("blank-every")
                .help("Insert a blank line after every Nth row")
                .value_parser(clap::value_parser!(u64)),
        )
        .get_matches();

    let rows: u64 = *matches.get_one("rows").unwrap();
    let with_header = !matches.get_flag("no_header");
    let extra_cols: usize = *matches.get_one("extra_cols").unwrap();
    let every = |name: &str| matches.get_one::<u64>(name).copied().filter(|n| *n > 0);
    let dup_every = every("dup_every");
    let bad_every = every("bad_every");
    let blank_every = every("blank_every");

    let mut out = io::BufWriter::new(io::stdout().lock());

    if with_header {
        write!(&mut out, "sku,name,description,active")?;
        for c in 1..=extra_cols {
            write!(&mut out, ",attr{c}")?;
        }
        writeln!(&mut out)?;
    }

    // Deterministic data: SKU0000000042,Product 42,...
    for i in 0..rows {
        let n = i + 1;
        let sku = if bad_every.is_some_and(|k| n % k == 0) {
            String::new()
        } else if i > 0 && dup_every.is_some_and(|k| n % k == 0) {
            format!("sku{:010}", i - 1)
        } else {
            format!("SKU{:010}", i)
        };
        let active = if i % 7 == 0 { "false" } else { "true" };
        write!(&mut out, "{sku},Product {i},Synthetic product number {i},{active}")?;
        for c in 1..=extra_cols {
            write!(&mut out, ",v{c}_{i}")?;
        }
        writeln!(&mut out)?;
        if blank_every.is_some_and(|k| n % k == 0) {
            writeln!(&mut out)?;
        }
        if i % 10_000 == 0 {
            out.flush()?;
        } // keep buffers moving on huge runs
    }

    out.flush()?;
    Ok(())
}
