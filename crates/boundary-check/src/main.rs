use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{Context, Result};
use cargo_metadata::MetadataCommand;

// Layering rules the workspace must keep:
//  - the privacy gate stays a pure function over artifacts (no stores, no
//    runner, no HTTP surface behind it),
//  - the shared contracts crate sits at the bottom of the graph.
const RULES: &[(&str, &[&str])] = &[
    (
        "fedra-policy",
        &[
            "fedra-store",
            "fedra-runner",
            "fedra-uploads",
            "fedra-catalog",
            "fedra-gateway",
        ],
    ),
    (
        "fedra-contracts",
        &[
            "fedra-catalog",
            "fedra-uploads",
            "fedra-store",
            "fedra-policy",
            "fedra-runner",
            "fedra-gateway",
        ],
    ),
];

fn main() -> Result<()> {
    let metadata = MetadataCommand::new()
        .exec()
        .context("failed to run `cargo metadata`")?;

    let resolve = metadata
        .resolve
        .as_ref()
        .context("`cargo metadata` did not include a resolved dependency graph")?;

    let name_of: HashMap<_, _> = metadata
        .packages
        .iter()
        .map(|p| (p.id.clone(), p.name.as_str()))
        .collect();
    let id_of: HashMap<_, _> = metadata
        .packages
        .iter()
        .map(|p| (p.name.as_str(), p.id.clone()))
        .collect();
    let edges: HashMap<_, Vec<_>> = resolve
        .nodes
        .iter()
        .map(|node| (node.id.clone(), node.deps.iter().map(|d| d.pkg.clone()).collect()))
        .collect();

    let mut failed = false;

    for (package, forbidden) in RULES {
        let root = id_of
            .get(package)
            .with_context(|| format!("package `{}` not found in workspace", package))?;

        let mut reachable = HashSet::new();
        let mut queue = VecDeque::from([root.clone()]);
        while let Some(current) = queue.pop_front() {
            for dep in edges.get(&current).into_iter().flatten() {
                if reachable.insert(dep.clone()) {
                    queue.push_back(dep.clone());
                }
            }
        }

        let mut violations: Vec<_> = reachable
            .iter()
            .filter_map(|id| name_of.get(id))
            .filter(|name| forbidden.contains(*name))
            .collect();
        violations.sort();

        if violations.is_empty() {
            println!("OK: `{}` keeps its dependency boundary", package);
        } else {
            failed = true;
            eprintln!(
                "FAIL: `{}` reaches forbidden crate(s): {}",
                package,
                violations
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}
