use anyhow::{bail, Result};
use std::iter::Peekable;
use std::path::PathBuf;
use std::slice::Iter;

use subgrid_api::{DatasetRequest, SortDirection};

pub const USAGE: &str = "\
Usage: subgrid [--config <path>] <command>

Commands:
  probe                                  Check connectivity to the service
  schema <entity>                        Print the entity's schema
  relate <parent> <child>                Discover the lookup column linking child to parent
  plan <entity> [query options]          Print the synthesized query without running it
  query <entity> [query options]         Load and convert a dataset

Query options:
  --parent <entity> <id>   Filter to records related to a parent record
  --relationship <name>    Relationship name for related queries
  --fields <a,b,c>         Columns to select
  --top <n>                Page size
  --order <field> [desc]   Sort column
  --view <guid>            Saved view id
  --count                  Request the total count";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Probe,
    Schema { entity: String },
    Relate { parent: String, child: String },
    Plan(DatasetRequest),
    Query(DatasetRequest),
    Help,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub config_path: Option<PathBuf>,
    pub command: Command,
}

pub fn parse_args<I>(args: I) -> Result<Invocation>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().peekable();
    let mut config_path = None;
    let mut positional = Vec::new();
    let mut request_flags = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => match args.next() {
                Some(path) => config_path = Some(PathBuf::from(path)),
                None => bail!("--config requires a path"),
            },
            "--help" | "-h" => {
                return Ok(Invocation {
                    config_path,
                    command: Command::Help,
                });
            }
            _ if arg.starts_with("--") => {
                request_flags.push(arg);
                while let Some(next) = args.peek() {
                    if next.starts_with("--") {
                        break;
                    }
                    if let Some(value) = args.next() {
                        request_flags.push(value);
                    }
                }
            }
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        None | Some("help") => Command::Help,
        Some("probe") => Command::Probe,
        Some("schema") => Command::Schema {
            entity: required(positional.next(), "schema <entity>")?,
        },
        Some("relate") => Command::Relate {
            parent: required(positional.next(), "relate <parent> <child>")?,
            child: required(positional.next(), "relate <parent> <child>")?,
        },
        Some(verb @ ("plan" | "query")) => {
            let entity = required(positional.next(), "<entity>")?;
            let request = parse_request(entity, &request_flags)?;
            if verb == "plan" {
                Command::Plan(request)
            } else {
                Command::Query(request)
            }
        }
        Some(other) => bail!("Unknown command '{}'\n\n{}", other, USAGE),
    };

    if !matches!(command, Command::Plan(_) | Command::Query(_)) && !request_flags.is_empty() {
        bail!("Query options are only valid for plan and query");
    }

    Ok(Invocation {
        config_path,
        command,
    })
}

fn required(value: Option<String>, usage: &str) -> Result<String> {
    match value {
        Some(v) => Ok(v),
        None => bail!("Missing argument: {}", usage),
    }
}

fn parse_request(entity: String, flags: &[String]) -> Result<DatasetRequest> {
    let mut request = DatasetRequest::new(entity);
    let mut flags = flags.iter().peekable();

    while let Some(flag) = flags.next() {
        match flag.as_str() {
            "--parent" => {
                let parent_entity = take_value(&mut flags, "--parent")?;
                let parent_id = take_value(&mut flags, "--parent")?;
                request = request.with_parent(parent_entity, parent_id);
            }
            "--relationship" => {
                let name = take_value(&mut flags, "--relationship")?;
                request = request.with_relationship_name(name);
            }
            "--fields" => {
                let fields = take_value(&mut flags, "--fields")?;
                request = request.with_fields(
                    fields
                        .split(',')
                        .map(str::trim)
                        .filter(|f| !f.is_empty())
                        .map(str::to_string)
                        .collect::<Vec<_>>(),
                );
            }
            "--top" => {
                let raw = take_value(&mut flags, "--top")?;
                let top: u32 = raw
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid --top '{}': {}", raw, e))?;
                request = request.with_page_size(top);
            }
            "--order" => {
                let field = take_value(&mut flags, "--order")?;
                let direction = match flags.next_if(|v| *v == "desc" || *v == "asc") {
                    Some(d) if d == "desc" => SortDirection::Desc,
                    _ => SortDirection::Asc,
                };
                request = request.with_order_by(field, direction);
            }
            "--view" => {
                let view_id = take_value(&mut flags, "--view")?;
                request = request.with_view(view_id);
            }
            "--count" => request = request.with_count(),
            other => bail!("Unknown option '{}'", other),
        }
    }
    Ok(request)
}

fn take_value(flags: &mut Peekable<Iter<'_, String>>, name: &str) -> Result<String> {
    match flags.next_if(|v| !v.starts_with("--")) {
        Some(v) => Ok(v.clone()),
        None => bail!("{} requires a value", name),
    }
}
