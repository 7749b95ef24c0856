use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use log::LevelFilter;
use texttransform::generator::class_name_for;
use texttransform::settings::read_tool_settings;
use texttransform::{
    find_templates, load_tool_settings, render_diagnostics, TemplateGenerator, TemplateWatcher,
    ToolSettings, TransformError, TransformationResult,
};

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(TransformError::Diagnostics) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), TransformError> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_help();
        return Ok(());
    };
    let rest: Vec<String> = args.collect();

    match command.as_str() {
        "-h" | "--help" | "help" => {
            print_help();
            Ok(())
        }
        "process" => cmd_process(&rest),
        "preprocess" => cmd_preprocess(&rest),
        "run" => cmd_run(&rest),
        "watch" => cmd_watch(&rest),
        other => Err(TransformError::InvalidArgument(format!(
            "unknown command {other}"
        ))),
    }
}

fn print_help() {
    println!(
        "texttransform\n\nUSAGE:\n  texttransform <COMMAND>\n\nCOMMANDS:\n  process <template.tt> [-o <output>] [OPTIONS]\n  preprocess <template.tt> [--class <Name>] [--namespace <a.b>] [-o <output.rs>] [OPTIONS]\n  run <template.tt|dir> [OPTIONS]\n  watch <template.tt|dir> [OPTIONS]\n  help\n\nOPTIONS:\n  -p [processor!directive!]name=value\n  -I <include dir>\n  -r <reference>\n  -P <reference dir>\n  --settings <texttransform.toml>\n  -v, --verbose\n\n  -h, --help"
    );
}

#[derive(Debug, Default)]
struct CommandArgs {
    target: Option<PathBuf>,
    output: Option<PathBuf>,
    class_name: Option<String>,
    namespace: Option<String>,
    parameters: Vec<String>,
    include_paths: Vec<PathBuf>,
    references: Vec<String>,
    reference_paths: Vec<PathBuf>,
    settings: Option<PathBuf>,
    verbose: bool,
}

fn parse_command_args(args: &[String]) -> Result<CommandArgs, TransformError> {
    let mut parsed = CommandArgs::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| {
            iter.next().cloned().ok_or_else(|| {
                TransformError::InvalidArgument(format!("{flag} expects a value"))
            })
        };
        let flag = arg.as_str();
        match flag {
            "-o" | "--out" => parsed.output = Some(PathBuf::from(value(flag)?)),
            "--class" => parsed.class_name = Some(value(flag)?),
            "--namespace" => parsed.namespace = Some(value(flag)?),
            "-p" => parsed.parameters.push(value(flag)?),
            "-I" => parsed.include_paths.push(PathBuf::from(value(flag)?)),
            "-r" => parsed.references.push(value(flag)?),
            "-P" => parsed.reference_paths.push(PathBuf::from(value(flag)?)),
            "--settings" => parsed.settings = Some(PathBuf::from(value(flag)?)),
            "-v" | "--verbose" => parsed.verbose = true,
            _ if arg.starts_with('-') => {
                return Err(TransformError::InvalidArgument(format!("unknown flag {arg}")))
            }
            _ if parsed.target.is_none() => parsed.target = Some(PathBuf::from(arg)),
            _ => {
                return Err(TransformError::InvalidArgument(format!(
                    "unexpected argument {arg}"
                )))
            }
        }
    }
    Ok(parsed)
}

/// `name=value` is global; `processor!directive!name=value` targets one
/// processor and directive, either of which may be left empty.
fn parse_parameter(raw: &str) -> Result<(Option<String>, Option<String>, String, String), TransformError> {
    let Some((key, value)) = raw.split_once('=') else {
        return Err(TransformError::InvalidArgument(format!(
            "parameter '{raw}' must look like name=value"
        )));
    };
    let parts: Vec<&str> = key.split('!').collect();
    let non_empty = |part: &str| Some(part.trim()).filter(|p| !p.is_empty()).map(str::to_string);
    match parts.as_slice() {
        [name] if !name.trim().is_empty() => Ok((None, None, name.trim().to_string(), value.to_string())),
        [processor, directive, name] if !name.trim().is_empty() => Ok((
            non_empty(processor),
            non_empty(directive),
            name.trim().to_string(),
            value.to_string(),
        )),
        _ => Err(TransformError::InvalidArgument(format!(
            "parameter '{raw}' must look like [processor!directive!]name=value"
        ))),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { LevelFilter::Debug } else { LevelFilter::Warn };
    let _ = env_logger::Builder::new()
        .filter_level(default)
        .parse_default_env()
        .try_init();
}

/// Settings from `--settings`, or from `texttransform.toml` next to `anchor`.
fn tool_settings(args: &CommandArgs, anchor: &Path) -> Result<ToolSettings, TransformError> {
    match &args.settings {
        Some(path) => read_tool_settings(path),
        None => {
            let dir = if anchor.is_dir() {
                anchor.to_path_buf()
            } else {
                anchor
                    .parent()
                    .filter(|dir| !dir.as_os_str().is_empty())
                    .map(Path::to_path_buf)
                    .unwrap_or(env::current_dir()?)
            };
            load_tool_settings(&dir)
        }
    }
}

fn build_generator(args: &CommandArgs, anchor: &Path) -> Result<TemplateGenerator, TransformError> {
    let settings = tool_settings(args, anchor)?;
    init_logging(args.verbose || settings.verbose);
    let mut generator = TemplateGenerator::from_tool_settings(&settings);
    for dir in &args.include_paths {
        generator.add_include_path(dir);
    }
    for dir in &args.reference_paths {
        generator.add_reference_path(dir);
    }
    for reference in &args.references {
        generator.add_reference(reference);
    }
    for raw in &args.parameters {
        let (processor, directive, name, value) = parse_parameter(raw)?;
        generator.add_parameter(processor.as_deref(), directive.as_deref(), &name, &value);
    }
    Ok(generator)
}

fn require_template(args: &CommandArgs) -> Result<PathBuf, TransformError> {
    let Some(target) = args.target.clone() else {
        return Err(TransformError::InvalidArgument(
            "missing template path".to_string(),
        ));
    };
    if !target.exists() {
        return Err(TransformError::InvalidPath(target.display().to_string()));
    }
    Ok(target)
}

fn report(generator: &TemplateGenerator) {
    let rendered = render_diagnostics(generator.errors());
    if !rendered.is_empty() {
        eprintln!("{rendered}");
    }
}

fn cmd_process(args: &[String]) -> Result<(), TransformError> {
    let args = parse_command_args(args)?;
    let template = require_template(&args)?;
    let mut generator = build_generator(&args, &template)?;
    let ok = generator.process_template_file(&template, args.output.as_deref());
    report(&generator);
    if !ok {
        return Err(TransformError::Diagnostics);
    }
    if let Some(output) = generator.output_file() {
        println!("{}", output.display());
    }
    Ok(())
}

fn cmd_preprocess(args: &[String]) -> Result<(), TransformError> {
    let args = parse_command_args(args)?;
    let template = require_template(&args)?;
    let mut generator = build_generator(&args, &template)?;
    let class_name = args
        .class_name
        .clone()
        .unwrap_or_else(|| class_name_for(&template));
    let namespace = args.namespace.clone().unwrap_or_default();
    let ok = generator.preprocess_template_file(
        &template,
        &class_name,
        &namespace,
        args.output.as_deref(),
    );
    report(&generator);
    if !ok {
        return Err(TransformError::Diagnostics);
    }
    if let Some(output) = generator.output_file() {
        println!("{}", output.display());
    }
    Ok(())
}

fn cmd_run(args: &[String]) -> Result<(), TransformError> {
    let args = parse_command_args(args)?;
    let target = require_template(&args)?;
    let settings = tool_settings(&args, &target)?;
    let templates = if target.is_dir() {
        find_templates(&target, &settings)
    } else {
        vec![target.clone()]
    };
    let mut generator = build_generator(&args, &target)?;

    let mut failed = false;
    for template in templates {
        failed |= !run_and_report(&mut generator, &template);
    }
    if failed {
        return Err(TransformError::Diagnostics);
    }
    Ok(())
}

/// Runs one template and prints its result. Returns false on failure.
fn run_and_report(generator: &mut TemplateGenerator, template: &Path) -> bool {
    let result = generator.run_for_template(template);
    report(generator);
    let label = match result {
        TransformationResult::Success => "generated",
        TransformationResult::NoChanges => "unchanged",
        TransformationResult::UnknownOutputType => "unknown output type",
        TransformationResult::TemplateProcessingError => "processing failed",
        TransformationResult::TemplateCompilationError => "compilation failed",
    };
    println!("{}: {label}", template.display());
    matches!(
        result,
        TransformationResult::Success | TransformationResult::NoChanges
    )
}

const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Re-runs templates when one of their trigger inputs changes. Runs until
/// interrupted.
fn cmd_watch(args: &[String]) -> Result<(), TransformError> {
    let args = parse_command_args(args)?;
    let target = require_template(&args)?;
    let settings = tool_settings(&args, &target)?;
    let mut generator = build_generator(&args, &target)?;
    let mut watcher = TemplateWatcher::new();
    println!("watching {}", target.display());

    loop {
        let templates = if target.is_dir() {
            find_templates(&target, &settings)
        } else {
            vec![target.clone()]
        };
        for template in &templates {
            if watcher.track(template) {
                run_and_report(&mut generator, template);
            }
        }
        watcher.poll();
        if let Some(template) = watcher.next_ready_timeout(WATCH_POLL_INTERVAL) {
            run_and_report(&mut generator, &template);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn command_args_collect_repeated_flags() {
        let args = parse_command_args(&strings(&[
            "a.tt", "-p", "name=World", "-I", "inc", "-I", "more", "-r", "serde", "-o", "out.txt",
        ]))
        .expect("parse");
        assert_eq!(args.target, Some(PathBuf::from("a.tt")));
        assert_eq!(args.parameters, vec!["name=World".to_string()]);
        assert_eq!(args.include_paths.len(), 2);
        assert_eq!(args.references, vec!["serde".to_string()]);
        assert_eq!(args.output, Some(PathBuf::from("out.txt")));

        assert!(parse_command_args(&strings(&["a.tt", "b.tt"])).is_err());
        assert!(parse_command_args(&strings(&["a.tt", "-o"])).is_err());
        assert!(parse_command_args(&strings(&["--bogus"])).is_err());
    }

    #[test]
    fn parameters_may_target_processors() {
        assert_eq!(
            parse_parameter("name=a=b").expect("global"),
            (None, None, "name".to_string(), "a=b".to_string())
        );
        assert_eq!(
            parse_parameter("RequiresProvides!!x=1").expect("scoped"),
            (Some("RequiresProvides".to_string()), None, "x".to_string(), "1".to_string())
        );
        assert!(parse_parameter("novalue").is_err());
        assert!(parse_parameter("a!b=1").is_err());
    }
}
