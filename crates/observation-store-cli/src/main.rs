//! CLI tool for pivoting narrow measure rows into observations.

mod error;
mod input;
mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use log::debug;
use observation_store_core::{
    BoundsSource, MeasureFilter, ObservationReader, ProcedureInfo, ResultDecimator, ResultMode,
    ResultProcessor, RowProcessor, StoreConfig, catalog::assign_tables, pivot::Pivot,
    request::ComparisonOperator,
};
use snafu::{ResultExt, ensure};

use crate::{
    error::{CliResult, ConfigSnafu, ZeroMaxFieldsSnafu, ZeroWidthSnafu},
    input::{open_cursor, parse_instant, read_filters, read_procedure, read_tables},
    output::{BatchFormat, Output},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormatArg {
    /// Observations as a JSON array
    Json,
    /// Data-array blocks as CSV
    Csv,
    /// Data-array blocks as JSON lines
    Jsonl,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Pivot narrow measure rows (CSV) into observations or blocks
    Pivot {
        /// Procedure description (JSON)
        #[arg(long)]
        procedure: PathBuf,

        /// Narrow-row CSV files, one per measure table in table order
        #[arg(long = "rows", required = true)]
        rows: Vec<PathBuf>,

        /// Store configuration (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Decimate to roughly this many blocks per series
        #[arg(long)]
        decimate: Option<usize>,

        /// Repeatable phenomenon names restricting the fields read
        #[arg(long = "phenomenon")]
        phenomenon: Vec<String>,

        /// Skip the first fields of the procedure
        #[arg(long = "field-offset", default_value_t = 0)]
        field_offset: usize,

        /// Emit one observation per profile cast
        #[arg(long = "separated-profile", default_value_t = false)]
        separated_profile: bool,

        #[arg(long, value_enum, default_value_t = OutputFormatArg::Json)]
        format: OutputFormatArg,

        /// Write to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Print the per-table SQL requests of a read
    Plan {
        /// Procedure description (JSON)
        #[arg(long)]
        procedure: PathBuf,

        /// Store configuration (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Redistribute measure fields over tables of at most this many columns
        #[arg(long = "max-fields")]
        max_fields: Option<usize>,

        /// Only rows strictly after this RFC 3339 instant
        #[arg(long)]
        after: Option<String>,

        /// Only rows strictly before this RFC 3339 instant
        #[arg(long)]
        before: Option<String>,

        /// Repeatable phenomenon names restricting the fields read
        #[arg(long = "phenomenon")]
        phenomenon: Vec<String>,

        /// JSON list of additional measure filters
        #[arg(long)]
        filters: Option<PathBuf>,

        /// Also print the bounds request of a decimated read of this width
        #[arg(long)]
        decimate: Option<usize>,

        #[arg(long = "field-offset", default_value_t = 0)]
        field_offset: usize,
    },
}

#[derive(Debug, Parser)]
#[command(name = "obsstore", version, about = "Observation store CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

struct PivotOpts {
    procedure: PathBuf,
    rows: Vec<PathBuf>,
    config: Option<PathBuf>,
    decimate: Option<usize>,
    phenomena: Vec<String>,
    field_offset: usize,
    separated_profile: bool,
    format: OutputFormatArg,
    output: Option<PathBuf>,
}

struct PlanOpts {
    procedure: PathBuf,
    config: Option<PathBuf>,
    max_fields: Option<usize>,
    after: Option<String>,
    before: Option<String>,
    phenomena: Vec<String>,
    filters: Option<PathBuf>,
    decimate: Option<usize>,
    field_offset: usize,
}

fn load_config(path: Option<&PathBuf>) -> CliResult<StoreConfig> {
    match path {
        Some(path) => StoreConfig::load(path).context(ConfigSnafu),
        None => Ok(StoreConfig::default()),
    }
}

fn decimation_width(flag: Option<usize>, config: &StoreConfig) -> CliResult<Option<usize>> {
    if let Some(width) = flag {
        ensure!(width > 0, ZeroWidthSnafu);
        return Ok(Some(width));
    }
    Ok(config.decimation_width)
}

fn cmd_pivot(opts: PivotOpts) -> CliResult<()> {
    let procedure = read_procedure(&opts.procedure)?;
    let mut config = load_config(opts.config.as_ref())?;
    config.separated_profile |= opts.separated_profile;
    let width = decimation_width(opts.decimate, &config)?;
    let tables = read_tables(&opts.rows, &procedure)?;

    let mut out = Output::open(opts.output.as_ref())?;
    let format = match opts.format {
        OutputFormatArg::Json => None,
        OutputFormatArg::Csv => Some(BatchFormat::Csv),
        OutputFormatArg::Jsonl => Some(BatchFormat::Jsonl),
    };

    let Some(format) = format else {
        let reader = ObservationReader::from_config(procedure.clone(), &config)
            .with_phenomena(opts.phenomena);
        let mut cursor = open_cursor(&tables, &procedure);
        let observations = match width {
            Some(width) => {
                let mut first_pass = open_cursor(&tables, &procedure);
                reader.read_decimated(
                    BoundsSource::Rows(&mut *first_pass),
                    &mut *cursor,
                    opts.field_offset,
                    width,
                )?
            }
            None => reader.read(&mut *cursor, opts.field_offset)?,
        };
        debug!("writing {} observation(s)", observations.len());
        return out.write_observations(&observations);
    };

    let mut options = config.processor_options(&procedure);
    options.mode = ResultMode::DataArray;
    let pivot = Pivot::new(procedure.clone(), options).with_phenomena(opts.phenomena);
    let mut processor: Box<dyn RowProcessor> = match width {
        Some(width) => {
            let mut decimator = ResultDecimator::from_pivot(pivot, width)?;
            let mut first_pass = open_cursor(&tables, &procedure);
            decimator.compute_bounds_from_rows(&mut *first_pass, opts.field_offset)?;
            Box::new(decimator)
        }
        None => Box::new(ResultProcessor::from_pivot(pivot)),
    };

    let mut cursor = open_cursor(&tables, &procedure);
    let blocks = processor.process_results(&mut *cursor, opts.field_offset)?;
    debug!("pivoted {blocks} block(s)");
    let builder = match processor.take_builder() {
        Some(builder) => builder,
        None => processor.pivot().new_builder(opts.field_offset)?,
    };
    let batch = builder.to_record_batch()?;
    out.write_batch(format, &batch)
}

/// Spread the non-main fields over tables of at most `max` columns.
fn redistribute(procedure: &mut ProcedureInfo, max: usize) {
    let main = procedure.main_field.name.clone();
    let measures: Vec<_> = procedure
        .fields
        .iter()
        .filter(|f| f.name != main)
        .cloned()
        .collect();
    let mut assigned = assign_tables(&measures, max).into_iter();
    for field in procedure.fields.iter_mut().filter(|f| f.name != main) {
        if let Some(next) = assigned.next() {
            *field = next;
        }
    }
}

fn time_filters(after: Option<&str>, before: Option<&str>) -> CliResult<Vec<MeasureFilter>> {
    let mut filters = Vec::new();
    if let Some(after) = after {
        filters.push(MeasureFilter::Time {
            operator: ComparisonOperator::Gt,
            value: parse_instant("after", after)?,
        });
    }
    if let Some(before) = before {
        filters.push(MeasureFilter::Time {
            operator: ComparisonOperator::Lt,
            value: parse_instant("before", before)?,
        });
    }
    Ok(filters)
}

fn cmd_plan(opts: PlanOpts) -> CliResult<()> {
    let mut procedure = read_procedure(&opts.procedure)?;
    let config = load_config(opts.config.as_ref())?;
    if let Some(max) = opts.max_fields {
        ensure!(max > 0, ZeroMaxFieldsSnafu);
        redistribute(&mut procedure, max);
    }
    let width = decimation_width(opts.decimate, &config)?;

    let mut filters = time_filters(opts.after.as_deref(), opts.before.as_deref())?;
    if let Some(path) = &opts.filters {
        filters.extend(read_filters(path)?);
    }

    let options = config.processor_options(&procedure);
    let pivot = Pivot::new(procedure, options).with_phenomena(opts.phenomena);
    let decimator = match width {
        Some(width) => Some(ResultDecimator::from_pivot(pivot.clone(), width)?),
        None => None,
    };
    let processor = ResultProcessor::from_pivot(pivot);

    let requests = config
        .request_builder()
        .with_filters(filters)
        .build(&processor, opts.field_offset)?;

    let mut out = Output::open(None)?;
    for table in &requests {
        let names: Vec<&str> = table.fields.iter().map(|f| f.name.as_str()).collect();
        out.write_text(&format!(
            "-- table {}: {} [{}]",
            table.table_number,
            table.request.table,
            names.join(", ")
        ))?;
        out.write_text(&format!("{};", table.request))?;
        for (i, param) in table.request.params.iter().enumerate() {
            out.write_text(&format!("--   ${} = {param}", i + 1))?;
        }
        if let Some(decimator) = &decimator {
            let bounds = decimator.bounds_request(&table.request, opts.field_offset)?;
            out.write_text(&format!("-- bounds\n{bounds};"))?;
        }
    }
    out.flush()
}

fn run() -> CliResult<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Pivot {
            procedure,
            rows,
            config,
            decimate,
            phenomenon,
            field_offset,
            separated_profile,
            format,
            output,
        } => cmd_pivot(PivotOpts {
            procedure,
            rows,
            config,
            decimate,
            phenomena: phenomenon,
            field_offset,
            separated_profile,
            format,
            output,
        }),
        Command::Plan {
            procedure,
            config,
            max_fields,
            after,
            before,
            phenomenon,
            filters,
            decimate,
            field_offset,
        } => cmd_plan(PlanOpts {
            procedure,
            config,
            max_fields,
            after,
            before,
            phenomena: phenomenon,
            filters,
            decimate,
            field_offset,
        }),
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    if let Err(e) = run() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
