use crate::host::TemplatingHost;
use crate::template::Directive;

/// Name the built-in requires/provides processor is registered under.
pub const REQUIRES_PROVIDES_PROCESSOR: &str = "RequiresProvides";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    #[error("directive processor '{0}' is already in a processing run")]
    AlreadyProcessing(String),
    #[error("directive processor '{0}' is not in a processing run")]
    NotProcessing(String),
    #[error("Could not resolve required value '{0}'")]
    UnresolvedRequired(String),
    #[error("{0}")]
    Message(String),
}

/// Extension point for directives the engine does not interpret itself.
///
/// One processing run covers one template: `start_processing_run`, then
/// `process_directive` for every routed directive in source order, then
/// `finish_processing_run`. Generated code is only readable once the run has
/// finished.
pub trait DirectiveProcessor {
    fn friendly_name(&self) -> &str;

    fn start_processing_run(&mut self) -> Result<(), ProcessorError>;

    /// Returns the code to splice in at the directive's position.
    fn process_directive(
        &mut self,
        host: &dyn TemplatingHost,
        directive: &Directive,
    ) -> Result<String, ProcessorError>;

    fn finish_processing_run(&mut self);

    /// Code run once when the transformation is initialized, before any
    /// post-initialization code.
    fn pre_initialization_code(&self) -> Result<String, ProcessorError>;

    fn post_initialization_code(&self) -> Result<String, ProcessorError>;

    /// Extra reference modules the generated unit must link against.
    fn references(&self) -> Vec<String> {
        Vec::new()
    }

    fn imports(&self) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    pub key: String,
    pub value: Option<String>,
}

/// `key=value` pairs from a `requires`/`provides` attribute, in source order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Arguments(Vec<Argument>);

impl Arguments {
    /// Splits `a=1;b;c=3`. A key without `=` has no value.
    pub fn parse(text: &str) -> Self {
        let mut arguments = Arguments::default();
        for pair in text.split(';') {
            let (key, value) = match pair.split_once('=') {
                Some((key, value)) => (key.trim(), Some(value.trim().to_string())),
                None => (pair.trim(), None),
            };
            if !key.is_empty() {
                arguments.set(key, value);
            }
        }
        arguments
    }

    pub fn get(&self, key: &str) -> Option<&Argument> {
        self.0.iter().find(|argument| argument.key == key)
    }

    pub fn set(&mut self, key: &str, value: Option<String>) {
        match self.0.iter_mut().find(|argument| argument.key == key) {
            Some(argument) => argument.value = value,
            None => self.0.push(Argument {
                key: key.to_string(),
                value,
            }),
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Argument> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Argument> {
        self.0.iter_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Code-producing half of a requires/provides processor. The argument
/// plumbing and buffering live in [`RequiresProvidesProcessor`].
pub trait RequiresProvidesGenerator {
    fn friendly_name(&self) -> &str;

    fn initialize_requires(&self, _directive_name: &str, _requires: &mut Arguments) {}

    fn initialize_provides(&self, _directive_name: &str, _provides: &mut Arguments) {}

    fn post_process_arguments(
        &self,
        _directive_name: &str,
        _requires: &mut Arguments,
        _provides: &mut Arguments,
    ) {
    }

    fn provide_unique_id(
        &self,
        directive_name: &str,
        _directive: &Directive,
        _requires: &Arguments,
        _provides: &Arguments,
    ) -> String {
        directive_name.to_string()
    }

    fn generate_pre_initialization_code(
        &self,
        directive_name: &str,
        buffer: &mut String,
        requires: &Arguments,
        provides: &Arguments,
    );

    fn generate_post_initialization_code(
        &self,
        directive_name: &str,
        buffer: &mut String,
        requires: &Arguments,
        provides: &Arguments,
    );

    fn generate_transform_code(
        &self,
        directive_name: &str,
        buffer: &mut String,
        requires: &Arguments,
        provides: &Arguments,
    );
}

pub struct RequiresProvidesProcessor<G> {
    generator: G,
    in_processing_run: bool,
    pre_init: String,
    post_init: String,
}

impl<G: RequiresProvidesGenerator> RequiresProvidesProcessor<G> {
    pub fn new(generator: G) -> Self {
        Self {
            generator,
            in_processing_run: false,
            pre_init: String::new(),
            post_init: String::new(),
        }
    }

    fn assert_not_processing(&self) -> Result<(), ProcessorError> {
        if self.in_processing_run {
            return Err(ProcessorError::AlreadyProcessing(
                self.generator.friendly_name().to_string(),
            ));
        }
        Ok(())
    }
}

impl<G: RequiresProvidesGenerator> DirectiveProcessor for RequiresProvidesProcessor<G> {
    fn friendly_name(&self) -> &str {
        self.generator.friendly_name()
    }

    fn start_processing_run(&mut self) -> Result<(), ProcessorError> {
        self.assert_not_processing()?;
        self.in_processing_run = true;
        self.pre_init.clear();
        self.post_init.clear();
        Ok(())
    }

    fn process_directive(
        &mut self,
        host: &dyn TemplatingHost,
        directive: &Directive,
    ) -> Result<String, ProcessorError> {
        if !self.in_processing_run {
            return Err(ProcessorError::NotProcessing(
                self.generator.friendly_name().to_string(),
            ));
        }
        let name = directive.name.as_str();
        let mut provides = directive
            .attribute("provides")
            .map(Arguments::parse)
            .unwrap_or_default();
        let mut requires = directive
            .attribute("requires")
            .map(Arguments::parse)
            .unwrap_or_default();

        self.generator.initialize_requires(name, &mut requires);
        self.generator.initialize_provides(name, &mut provides);

        let id = self
            .generator
            .provide_unique_id(name, directive, &requires, &provides);
        let processor = self.generator.friendly_name().to_string();

        for argument in requires.iter_mut() {
            match host.resolve_parameter_value(Some(&id), Some(&processor), &argument.key) {
                Some(value) => argument.value = Some(value),
                None if argument.value.is_none() => {
                    return Err(ProcessorError::UnresolvedRequired(argument.key.clone()));
                }
                None => {}
            }
        }
        for argument in provides.iter_mut() {
            if let Some(value) =
                host.resolve_parameter_value(Some(&id), Some(&processor), &argument.key)
            {
                argument.value = Some(value);
            }
        }

        self.generator
            .post_process_arguments(name, &mut requires, &mut provides);

        let mut transform = String::new();
        self.generator
            .generate_pre_initialization_code(name, &mut self.pre_init, &requires, &provides);
        self.generator
            .generate_post_initialization_code(name, &mut self.post_init, &requires, &provides);
        self.generator
            .generate_transform_code(name, &mut transform, &requires, &provides);
        Ok(transform)
    }

    fn finish_processing_run(&mut self) {
        self.in_processing_run = false;
    }

    fn pre_initialization_code(&self) -> Result<String, ProcessorError> {
        self.assert_not_processing()?;
        Ok(self.pre_init.clone())
    }

    fn post_initialization_code(&self) -> Result<String, ProcessorError> {
        self.assert_not_processing()?;
        Ok(self.post_init.clone())
    }
}

/// Built-in generator: resolved values are stored into the transformation
/// session, and keys that are valid identifiers become `String` locals of
/// `transform_text`.
///
/// Inline `requires` values are not defaults here; every required key must
/// come from the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionParameterGenerator;

impl SessionParameterGenerator {
    pub fn processor() -> RequiresProvidesProcessor<SessionParameterGenerator> {
        RequiresProvidesProcessor::new(SessionParameterGenerator)
    }
}

impl RequiresProvidesGenerator for SessionParameterGenerator {
    fn friendly_name(&self) -> &str {
        REQUIRES_PROVIDES_PROCESSOR
    }

    fn initialize_requires(&self, _directive_name: &str, requires: &mut Arguments) {
        for argument in requires.iter_mut() {
            argument.value = None;
        }
    }

    fn generate_pre_initialization_code(
        &self,
        _directive_name: &str,
        _buffer: &mut String,
        _requires: &Arguments,
        _provides: &Arguments,
    ) {
    }

    fn generate_post_initialization_code(
        &self,
        _directive_name: &str,
        buffer: &mut String,
        requires: &Arguments,
        provides: &Arguments,
    ) {
        for argument in requires.iter().chain(provides.iter()) {
            if let Some(value) = &argument.value {
                buffer.push_str(&format!(
                    "self.set_session_value({:?}, {:?});\n",
                    argument.key, value
                ));
            }
        }
    }

    fn generate_transform_code(
        &self,
        _directive_name: &str,
        buffer: &mut String,
        requires: &Arguments,
        provides: &Arguments,
    ) {
        for argument in requires.iter().chain(provides.iter()) {
            if is_identifier(&argument.key) {
                buffer.push_str(&format!(
                    "let {}: String = self.session_value({:?}).unwrap_or_default().to_string();\n",
                    argument.key, argument.key
                ));
            }
        }
    }
}

const RESERVED: &[&str] = &[
    "_", "as", "async", "await", "break", "const", "continue", "crate", "dyn", "else", "enum",
    "extern", "false", "fn", "for", "if", "impl", "in", "let", "loop", "match", "mod", "move",
    "mut", "pub", "ref", "return", "self", "Self", "static", "struct", "super", "trait", "true",
    "type", "unsafe", "use", "where", "while", "yield",
];

pub(crate) fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) if first == '_' || first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    !RESERVED.contains(&text) && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}
