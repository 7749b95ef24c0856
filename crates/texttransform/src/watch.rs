use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::{debug, warn};
use walkdir::WalkDir;

use crate::scheduler::DebounceScheduler;
use crate::settings::{load_template_options, template_options_path, TemplateOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileFingerprint {
    pub modified: SystemTime,
    pub len: u64,
}

/// Fingerprints every file at or below `path`. Missing paths yield nothing.
pub fn collect_fingerprints(path: &Path, into: &mut HashMap<PathBuf, FileFingerprint>) {
    for entry in WalkDir::new(path).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        into.insert(
            entry.into_path(),
            FileFingerprint {
                modified,
                len: metadata.len(),
            },
        );
    }
}

/// The template, its sidecar settings and, when asset triggers are enabled,
/// its watched paths (relative ones resolved against the template).
pub fn trigger_inputs(template: &Path, options: &TemplateOptions) -> Vec<PathBuf> {
    let mut inputs = vec![template.to_path_buf(), template_options_path(template)];
    if options.generation_triggers.asset_changes {
        let dir = template.parent().unwrap_or(Path::new(""));
        inputs.extend(options.watched_paths.iter().map(|path| {
            if path.is_relative() {
                dir.join(path)
            } else {
                path.clone()
            }
        }));
    }
    inputs
}

struct WatchedTemplate {
    options: TemplateOptions,
    fingerprints: HashMap<PathBuf, FileFingerprint>,
}

impl WatchedTemplate {
    fn snapshot(template: &Path) -> Self {
        let options = load_template_options(template).unwrap_or_else(|err| {
            warn!("{err}; using default template settings");
            TemplateOptions::default()
        });
        let mut fingerprints = HashMap::new();
        for input in trigger_inputs(template, &options) {
            collect_fingerprints(&input, &mut fingerprints);
        }
        Self {
            options,
            fingerprints,
        }
    }
}

/// Polls templates and their trigger inputs. A change schedules the template
/// after its trigger delay; further changes inside the delay restart it.
pub struct TemplateWatcher {
    templates: HashMap<PathBuf, WatchedTemplate>,
    scheduler: DebounceScheduler<PathBuf>,
}

impl Default for TemplateWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateWatcher {
    pub fn new() -> Self {
        Self {
            templates: HashMap::new(),
            scheduler: DebounceScheduler::new(),
        }
    }

    /// Starts tracking `template`. Returns false when it is already tracked.
    pub fn track(&mut self, template: &Path) -> bool {
        if self.templates.contains_key(template) {
            return false;
        }
        debug!("watching {}", template.display());
        self.templates
            .insert(template.to_path_buf(), WatchedTemplate::snapshot(template));
        true
    }

    /// Stops tracking `template` and drops its pending run.
    pub fn untrack(&mut self, template: &Path) -> bool {
        self.scheduler.cancel(&template.to_path_buf());
        self.templates.remove(template).is_some()
    }

    pub fn tracked(&self) -> usize {
        self.templates.len()
    }

    pub fn delay_for(&self, template: &Path) -> Option<Duration> {
        self.templates
            .get(template)
            .map(|watched| watched.options.trigger_delay())
    }

    /// Re-fingerprints every template and schedules the changed ones.
    /// Returns how many were scheduled.
    pub fn poll(&mut self) -> usize {
        let mut scheduled = 0;
        for (template, watched) in &mut self.templates {
            let current = WatchedTemplate::snapshot(template);
            if current.fingerprints == watched.fingerprints {
                continue;
            }
            *watched = current;
            if !fs::metadata(template).is_ok_and(|meta| meta.is_file()) {
                self.scheduler.cancel(template);
                continue;
            }
            let delay = watched.options.trigger_delay();
            debug!("{} changed; running in {delay:?}", template.display());
            self.scheduler.schedule(template.clone(), delay);
            scheduled += 1;
        }
        scheduled
    }

    pub fn pending(&self) -> usize {
        self.scheduler.pending()
    }

    pub fn next_ready_timeout(&self, timeout: Duration) -> Option<PathBuf> {
        self.scheduler.next_ready_timeout(timeout)
    }

    pub fn try_next_ready(&self) -> Option<PathBuf> {
        self.scheduler.try_next_ready()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::TEMPLATE_OPTIONS_SUFFIX;

    const PATIENCE: Duration = Duration::from_secs(5);

    fn write_options(template: &Path, json: &str) {
        let mut name = template.as_os_str().to_os_string();
        name.push(TEMPLATE_OPTIONS_SUFFIX);
        fs::write(PathBuf::from(name), json).expect("write options");
    }

    #[test]
    fn watched_paths_only_count_with_asset_triggers() {
        let template = Path::new("/work/gen.tt");
        let mut options = TemplateOptions {
            watched_paths: vec![PathBuf::from("data"), PathBuf::from("/abs/schema.json")],
            ..TemplateOptions::default()
        };
        assert_eq!(trigger_inputs(template, &options).len(), 2);

        options.generation_triggers.asset_changes = true;
        let inputs = trigger_inputs(template, &options);
        assert!(inputs.contains(&PathBuf::from("/work/data")));
        assert!(inputs.contains(&PathBuf::from("/abs/schema.json")));
    }

    #[test]
    fn unchanged_inputs_schedule_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let template = dir.path().join("a.tt");
        fs::write(&template, "text").expect("write template");

        let mut watcher = TemplateWatcher::new();
        assert!(watcher.track(&template));
        assert!(!watcher.track(&template));
        assert_eq!(watcher.poll(), 0);
        assert_eq!(watcher.pending(), 0);
    }

    #[test]
    fn asset_changes_schedule_after_the_trigger_delay() {
        let dir = tempfile::tempdir().expect("tempdir");
        let template = dir.path().join("gen.tt");
        fs::write(&template, "text").expect("write template");
        fs::create_dir_all(dir.path().join("data")).expect("mkdir");
        write_options(
            &template,
            r#"{ "generationTriggers": { "assetChanges": true }, "watchedPaths": ["data"], "triggerDelayMs": 600 }"#,
        );

        let mut watcher = TemplateWatcher::new();
        watcher.track(&template);
        assert_eq!(watcher.delay_for(&template), Some(Duration::from_millis(600)));

        fs::write(dir.path().join("data/items.csv"), "a,b").expect("write asset");
        assert_eq!(watcher.poll(), 1);
        assert_eq!(watcher.try_next_ready(), None);
        assert_eq!(watcher.next_ready_timeout(PATIENCE), Some(template.clone()));
        assert_eq!(watcher.poll(), 0);
    }

    #[test]
    fn assets_are_ignored_without_the_trigger() {
        let dir = tempfile::tempdir().expect("tempdir");
        let template = dir.path().join("gen.tt");
        fs::write(&template, "text").expect("write template");
        write_options(&template, r#"{ "watchedPaths": ["data"] }"#);

        let mut watcher = TemplateWatcher::new();
        watcher.track(&template);
        fs::create_dir_all(dir.path().join("data")).expect("mkdir");
        fs::write(dir.path().join("data/items.csv"), "a,b").expect("write asset");
        assert_eq!(watcher.poll(), 0);
    }

    #[test]
    fn untracked_templates_lose_their_pending_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let template = dir.path().join("a.tt");
        fs::write(&template, "one").expect("write template");

        let mut watcher = TemplateWatcher::new();
        watcher.track(&template);
        fs::write(&template, "a longer body").expect("rewrite template");
        assert_eq!(watcher.poll(), 1);
        assert!(watcher.untrack(&template));
        assert_eq!(watcher.tracked(), 0);
        assert_eq!(watcher.pending(), 0);
    }
}
