use std::collections::HashSet;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::SUPPORTED_EXTENSIONS;

/// One track to analyze and where its reference goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub input: PathBuf,
    pub output: PathBuf,
}

#[derive(Debug, Default)]
pub struct JobPlan {
    pub jobs: Vec<Job>,
    /// Inputs whose output already exists.
    pub skipped: Vec<PathBuf>,
    /// Inputs that would overwrite another job's output.
    pub collisions: Vec<PathBuf>,
}

pub fn is_supported(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    SUPPORTED_EXTENSIONS.contains(&ext.as_str())
}

/// Output path for `input`: `<out_dir>/<stem>.json`, or beside the input.
pub fn output_path(input: &Path, out_dir: Option<&Path>) -> PathBuf {
    let name = Path::new(input.file_stem().unwrap_or(input.as_os_str())).with_extension("json");
    match out_dir {
        Some(dir) => dir.join(name),
        None => input.with_file_name(name),
    }
}

/// Expand `inputs` (files or directories) into analysis jobs.
///
/// Directories are walked recursively and filtered to supported audio
/// extensions; explicitly named files are taken as given. Files are visited
/// in sorted order so collisions resolve the same way on every run.
pub fn plan_jobs(inputs: &[PathBuf], out_dir: Option<&Path>, force: bool) -> JobPlan {
    let mut files: Vec<PathBuf> = Vec::new();
    for input in inputs {
        if input.is_file() {
            files.push(input.clone());
            continue;
        }
        for entry in WalkDir::new(input).follow_links(true).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() && is_supported(entry.path()) {
                files.push(entry.into_path());
            }
        }
    }
    files.sort();
    files.dedup();

    let mut plan = JobPlan::default();
    let mut claimed: HashSet<PathBuf> = HashSet::new();
    for input in files {
        let output = output_path(&input, out_dir);
        if !claimed.insert(output.clone()) {
            log::warn!("Skipping {}: {} is already claimed", input.display(), output.display());
            plan.collisions.push(input);
            continue;
        }
        if !force && output.exists() {
            log::debug!("Skipping {} (already analyzed)", input.display());
            plan.skipped.push(input);
            continue;
        }
        plan.jobs.push(Job { input, output });
    }

    log::info!(
        "Planned {} jobs ({} already done, {} collisions)",
        plan.jobs.len(),
        plan.skipped.len(),
        plan.collisions.len()
    );
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"").unwrap();
    }

    #[test]
    fn test_output_path() {
        assert_eq!(
            output_path(Path::new("/music/a/song.flac"), None),
            PathBuf::from("/music/a/song.json")
        );
        assert_eq!(
            output_path(Path::new("/music/a/song.v2.mp3"), Some(Path::new("/out"))),
            PathBuf::from("/out/song.v2.json")
        );
    }

    #[test]
    fn test_is_supported_ignores_case() {
        assert!(is_supported(Path::new("x.WAV")));
        assert!(is_supported(Path::new("x.flac")));
        assert!(!is_supported(Path::new("x.txt")));
        assert!(!is_supported(Path::new("noext")));
    }

    #[test]
    fn test_plan_walks_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a.wav"));
        touch(&dir.path().join("nested/b.mp3"));
        touch(&dir.path().join("notes.txt"));

        let out = dir.path().join("out");
        let plan = plan_jobs(&[dir.path().to_path_buf()], Some(&out), false);
        let outputs: Vec<_> = plan.jobs.iter().map(|j| j.output.clone()).collect();
        assert_eq!(outputs, vec![out.join("a.json"), out.join("b.json")]);
        assert!(plan.skipped.is_empty());
    }

    #[test]
    fn test_plan_skips_existing_unless_forced() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a.wav"));
        touch(&dir.path().join("a.json"));

        let plan = plan_jobs(&[dir.path().to_path_buf()], None, false);
        assert!(plan.jobs.is_empty());
        assert_eq!(plan.skipped.len(), 1);

        let plan = plan_jobs(&[dir.path().to_path_buf()], None, true);
        assert_eq!(plan.jobs.len(), 1);
    }

    #[test]
    fn test_plan_reports_output_collisions() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("x/song.wav"));
        touch(&dir.path().join("y/song.flac"));

        let out = dir.path().join("out");
        let plan = plan_jobs(&[dir.path().to_path_buf()], Some(&out), false);
        assert_eq!(plan.jobs.len(), 1);
        assert_eq!(plan.jobs[0].input, dir.path().join("x/song.wav"));
        assert_eq!(plan.collisions, vec![dir.path().join("y/song.flac")]);
    }

    #[test]
    fn test_explicit_files_are_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.wav");
        touch(&file);
        let plan = plan_jobs(&[file.clone(), file.clone()], None, false);
        assert_eq!(plan.jobs.len(), 1);
        assert!(plan.collisions.is_empty());
    }
}
