use super::*;
use crate::settings::TEMPLATE_OPTIONS_SUFFIX;
use crate::template::ParsedTemplate;
use std::path::PathBuf;

fn generator() -> TemplateGenerator {
    TemplateGenerator::from_tool_settings(&ToolSettings::default())
}

#[test]
fn parameter_lookup_falls_back_to_global_key() {
    let mut generator = generator();
    generator.add_parameter(None, None, "name", "global");
    generator.add_parameter(Some("RequiresProvides"), Some("template"), "name", "specific");

    assert_eq!(
        generator.resolve_parameter_value(Some("template"), Some("RequiresProvides"), "name"),
        Some("specific".to_string())
    );
    assert_eq!(
        generator.resolve_parameter_value(Some("other"), Some("RequiresProvides"), "name"),
        Some("global".to_string())
    );
    assert_eq!(generator.resolve_parameter_value(None, None, "missing"), None);

    let session = generator.session_parameters();
    assert_eq!(session.len(), 1);
    assert_eq!(session.get("name").map(String::as_str), Some("global"));
}

#[test]
fn includes_are_found_through_include_paths() {
    let dir = tempfile::tempdir().expect("tempdir");
    let shared = dir.path().join("shared");
    fs::create_dir_all(&shared).expect("mkdir");
    fs::write(shared.join("header.tt"), "HEADER\n").expect("write include");

    let mut generator = generator();
    generator.add_include_path(&shared);
    let include = generator.load_include_text("header.tt").expect("include found");
    assert_eq!(include.content, "HEADER\n");
    assert!(include.resolved_name.ends_with("header.tt"));
    assert!(generator.load_include_text("absent.tt").is_none());
}

#[test]
fn includes_next_to_the_template_win_over_include_paths() {
    let dir = tempfile::tempdir().expect("tempdir");
    let templates = dir.path().join("templates");
    let shared = dir.path().join("shared");
    fs::create_dir_all(&templates).expect("mkdir");
    fs::create_dir_all(&shared).expect("mkdir");
    fs::write(templates.join("part.tt"), "local").expect("write local include");
    fs::write(shared.join("part.tt"), "shared").expect("write shared include");
    fs::write(shared.join("only-shared.tt"), "fallback").expect("write shared include");
    let template_path = fs::canonicalize(&templates).expect("canonical").join("main.tt");
    fs::write(&template_path, "").expect("write template");

    let mut generator = generator();
    generator.add_include_path(&shared);
    generator.template_file = Some(template_path.display().to_string());

    let resolved = generator.resolve_path("part.tt");
    assert_eq!(PathBuf::from(&resolved), template_path.with_file_name("part.tt"));
    let include = generator.load_include_text("part.tt").expect("include found");
    assert_eq!(include.content, "local");
    assert_eq!(include.resolved_name, resolved);
    let fallback = generator.load_include_text("only-shared.tt").expect("include found");
    assert_eq!(fallback.content, "fallback");
}

#[test]
fn included_segments_are_spliced_in_place() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("b.txt"), "from b").expect("write include");
    let template_path = dir.path().join("a.tt");
    fs::write(&template_path, "").expect("write template");

    let mut generator = generator();
    generator.template_file = Some(template_path.display().to_string());
    let template =
        ParsedTemplate::from_text("before <#@ include file=\"b.txt\" #> after", &generator);
    assert!(template.errors().is_empty(), "{:?}", template.errors());
    let texts: Vec<&str> = template.content().map(|s| s.text.as_str()).collect();
    assert_eq!(texts, vec!["before ", "from b", " after"]);
    assert_eq!(template.directives().count(), 0);
}

#[test]
fn references_resolve_against_reference_paths() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("libhelpers.rlib"), b"").expect("write rlib");

    let mut generator = generator();
    generator.add_reference_path(dir.path());
    let resolved = generator.resolve_assembly_reference("helpers");
    assert_eq!(PathBuf::from(&resolved), dir.path().join("libhelpers.rlib"));
    assert_eq!(generator.resolve_assembly_reference("proc_macro"), "proc_macro");
    assert_eq!(
        generator.resolve_assembly_reference("x=/deps/libx.rlib"),
        "x=/deps/libx.rlib"
    );
}

#[test]
fn output_path_follows_extension_directive() {
    let mut generator = generator();
    let input = Path::new("/work/report.tt");
    assert_eq!(generator.output_path_for(input, None), PathBuf::from("/work/report.txt"));

    generator.set_file_extension(".rs");
    assert_eq!(generator.output_path_for(input, None), PathBuf::from("/work/report.rs"));
    assert_eq!(
        generator.output_path_for(input, Some(Path::new("/out/report.txt"))),
        PathBuf::from("/out/report.rs")
    );
}

#[test]
fn unknown_processors_are_reported_by_name() {
    let generator = generator();
    let err = generator.resolve_directive_processor("Custom").err();
    assert_eq!(err.as_deref(), Some("directive processor 'Custom' is not registered"));
}

#[test]
fn unreadable_template_is_a_diagnostic() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut generator = generator();
    let missing = dir.path().join("missing.tt");
    assert!(!generator.process_template_file(&missing, None));
    assert_eq!(generator.errors()[0].code, "TT5001");
    assert!(generator.output_file().is_none());
}

#[test]
fn unknown_output_type_is_reported_without_running() {
    let dir = tempfile::tempdir().expect("tempdir");
    let template = dir.path().join("gen.tt");
    fs::write(&template, "text").expect("write template");
    fs::write(
        dir.path().join(format!("gen.tt{TEMPLATE_OPTIONS_SUFFIX}")),
        r#"{ "outputType": "Spreadsheet" }"#,
    )
    .expect("write options");

    let mut generator = generator();
    assert_eq!(
        generator.run_for_template(&template),
        TransformationResult::UnknownOutputType
    );
    assert!(!dir.path().join("gen.txt").exists());
}

#[test]
fn template_failures_before_execution_are_compilation_errors() {
    let dir = tempfile::tempdir().expect("tempdir");
    let template = dir.path().join("broken.tt");
    fs::write(&template, "<#@ template requires=\"x=1\" #>text").expect("write template");
    fs::write(
        dir.path().join(format!("broken.tt{TEMPLATE_OPTIONS_SUFFIX}")),
        r#"{ "outputType": "Text" }"#,
    )
    .expect("write options");

    let mut generator = generator();
    assert_eq!(
        generator.run_for_template(&template),
        TransformationResult::TemplateCompilationError
    );
    assert!(!dir.path().join("broken.txt").exists());
    assert!(generator.has_errors());
}

#[test]
fn class_names_come_from_file_stems() {
    assert_eq!(class_name_for(Path::new("my-report.tt")), "MyReport");
    assert_eq!(class_name_for(Path::new("dir/entity_list.tt")), "EntityList");
    assert_eq!(class_name_for(Path::new("2024.tt")), "Template2024");
}

#[test]
fn templates_are_listed_without_excluded_dirs() {
    let dir = tempfile::tempdir().expect("tempdir");
    for path in ["a.tt", "sub/b.tt", "target/c.tt", "notes.txt"] {
        let path = dir.path().join(path);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, "").expect("write");
    }
    let settings = ToolSettings {
        exclude_paths: vec![PathBuf::from("target")],
        ..ToolSettings::default()
    };
    let found = find_templates(dir.path(), &settings);
    assert_eq!(
        found,
        vec![dir.path().join("a.tt"), dir.path().join("sub/b.tt")]
    );
}
