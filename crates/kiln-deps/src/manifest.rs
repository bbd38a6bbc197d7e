use crate::modules::KnownModules;
use std::collections::BTreeSet;

/// Maps used modules to pip requirement lines, dropping the standard library.
///
/// Modules outside the curated list are passed through under their import
/// name; if no such distribution exists the image build fails and reports it.
pub fn requirements<'a, I>(known: &KnownModules, modules: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a String>,
{
    modules
        .into_iter()
        .map(|module| module.split('.').next().unwrap_or(module))
        .filter(|module| !module.is_empty() && !module.starts_with('_'))
        .filter(|module| !known.is_stdlib(module))
        .map(|module| known.pip_name(module).to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Renders `requirements.txt`.
pub fn render(requirements: &[String]) -> String {
    let mut out = String::new();
    for line in requirements {
        out.push_str(line);
        out.push('\n');
    }
    out
}
