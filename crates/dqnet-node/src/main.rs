//! dqnet node binary: wires up a query network from a TOML scenario, runs it,
//! and prints each request's answer as JSON.
//!
//! Everything runs in one process. Solvers, sources, and requests are tokio
//! tasks connected by in-memory links.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use dqnet_core::Bindings;
use dqnet_engine::{connect, Solver, SolverConfig};
use dqnet_source_local::{Answer, Request, Source};
use dqnet_swarm::NodeId;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Run a dqnet query-network scenario", long_about = None)]
struct Cli {
    /// Scenario file to run
    #[arg(long, default_value = "scenario.toml")]
    config: PathBuf,

    /// Pretty-print the JSON output
    #[arg(long)]
    pretty: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct NetworkConfig {
    announce_interval_ms: u64,
    link_capacity: usize,
    /// Time given to routing before any request is issued.
    settle_ms: u64,
    /// Per-request wait; unanswered requests are reported as stalled.
    answer_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let solver = SolverConfig::default();
        Self {
            announce_interval_ms: solver.announce_interval.as_millis() as u64,
            link_capacity: solver.link_capacity,
            settle_ms: 1000,
            answer_timeout_ms: 5000,
        }
    }
}

impl NetworkConfig {
    fn solver_config(&self) -> SolverConfig {
        SolverConfig {
            announce_interval: Duration::from_millis(self.announce_interval_ms.max(1)),
            link_capacity: self.link_capacity.max(1),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SolverSpec {
    id: String,
    #[serde(default)]
    rules: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LinkSpec {
    a: String,
    b: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SourceSpec {
    id: String,
    solver: String,
    fact: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RouteSpec {
    solver: String,
    key: String,
    neighbor: String,
    #[serde(default = "default_metric")]
    metric: u32,
}

fn default_metric() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
struct RequestSpec {
    id: String,
    solver: String,
    query: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ScenarioConfig {
    solver: NetworkConfig,
    solvers: Vec<SolverSpec>,
    links: Vec<LinkSpec>,
    sources: Vec<SourceSpec>,
    routes: Vec<RouteSpec>,
    requests: Vec<RequestSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Outcome {
    Bound { bindings: Bindings },
    NoMatch,
    Stalled,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct RequestOutcome {
    request: String,
    query: String,
    #[serde(flatten)]
    outcome: Outcome,
}

fn load_config(path: &Path) -> Result<ScenarioConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading scenario {}", path.display()))?;
    let cfg: ScenarioConfig =
        toml::from_str(&text).with_context(|| format!("parsing scenario {}", path.display()))?;
    Ok(cfg)
}

fn lookup<'a>(solvers: &'a BTreeMap<String, Arc<Solver>>, id: &str) -> Result<&'a Arc<Solver>> {
    solvers
        .get(id)
        .ok_or_else(|| anyhow!("unknown solver `{id}`"))
}

async fn run_scenario(cfg: ScenarioConfig) -> Result<Vec<RequestOutcome>> {
    let solver_config = cfg.solver.solver_config();
    let mut solvers: BTreeMap<String, Arc<Solver>> = BTreeMap::new();
    for spec in &cfg.solvers {
        if solvers.contains_key(&spec.id) {
            bail!("duplicate solver `{}`", spec.id);
        }
        let solver = Solver::new(NodeId::new(spec.id.as_str()), solver_config.clone());
        for rule in &spec.rules {
            solver
                .add_rule(rule)
                .with_context(|| format!("rule for solver `{}`", spec.id))?;
        }
        solvers.insert(spec.id.clone(), solver);
    }

    for spec in &cfg.links {
        let a = lookup(&solvers, &spec.a)?;
        let b = lookup(&solvers, &spec.b)?;
        connect(a, b).with_context(|| format!("linking `{}` and `{}`", spec.a, spec.b))?;
    }

    let mut sources = Vec::with_capacity(cfg.sources.len());
    for spec in &cfg.sources {
        let source = Source::parse(NodeId::new(spec.id.as_str()), &spec.fact)
            .with_context(|| format!("fact for source `{}`", spec.id))?;
        let endpoint = lookup(&solvers, &spec.solver)?
            .attach_source(source.id(), &source.key())
            .with_context(|| format!("attaching source `{}`", spec.id))?;
        sources.push((source, endpoint));
    }

    for spec in &cfg.routes {
        lookup(&solvers, &spec.solver)?
            .add_forwarding_entry(&spec.key, &NodeId::new(spec.neighbor.as_str()), spec.metric)
            .with_context(|| format!("static route on `{}`", spec.solver))?;
    }

    let mut requests = Vec::with_capacity(cfg.requests.len());
    for spec in &cfg.requests {
        let request = Request::parse(NodeId::new(spec.id.as_str()), &spec.query)
            .with_context(|| format!("query for request `{}`", spec.id))?;
        let endpoint = lookup(&solvers, &spec.solver)?
            .attach_request(request.id())
            .with_context(|| format!("attaching request `{}`", spec.id))?;
        requests.push((request, endpoint));
    }

    let mut tasks = Vec::new();
    for solver in solvers.values() {
        tasks.extend(solver.spawn()?);
    }
    for (source, endpoint) in sources {
        tasks.push(tokio::spawn(source.run(endpoint)));
    }
    info!(
        solvers = solvers.len(),
        requests = requests.len(),
        "network started"
    );

    tokio::time::sleep(Duration::from_millis(cfg.solver.settle_ms)).await;
    for (id, solver) in &solvers {
        for (key, route) in solver.routes() {
            info!(solver = %id, key = %key, nexthop = %route.nexthop, metric = route.metric, "route");
        }
    }

    let wait = Duration::from_millis(cfg.solver.answer_timeout_ms);
    let running: Vec<_> = requests
        .into_iter()
        .map(|(request, endpoint)| {
            let name = request.id().to_string();
            let query = request.query().to_string();
            let handle = tokio::spawn(tokio::time::timeout(wait, request.run(endpoint)));
            (name, query, handle)
        })
        .collect();

    let mut outcomes = Vec::with_capacity(running.len());
    for (request, query, handle) in running {
        let outcome = match handle.await {
            Ok(Ok(Ok(Answer::Bound(bindings)))) => Outcome::Bound { bindings },
            Ok(Ok(Ok(Answer::NoMatch))) => Outcome::NoMatch,
            Ok(Ok(Err(err))) => Outcome::Failed {
                error: err.to_string(),
            },
            Ok(Err(_)) => {
                warn!(request = %request, query = %query, "request stalled");
                Outcome::Stalled
            }
            Err(err) => Outcome::Failed {
                error: err.to_string(),
            },
        };
        outcomes.push(RequestOutcome {
            request,
            query,
            outcome,
        });
    }

    for task in tasks {
        task.abort();
    }
    Ok(outcomes)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;
    let outcomes = run_scenario(cfg).await?;
    let json = if cli.pretty {
        serde_json::to_string_pretty(&outcomes)?
    } else {
        serde_json::to_string(&outcomes)?
    };
    println!("{json}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const WESTWOOD: &str = r#"
[solver]
announce_interval_ms = 20
settle_ms = 300
answer_timeout_ms = 2000

[[solvers]]
id = "s1"
rules = ["loc(?X) <- loc2(?X).", "loc2(?L) <- location(?L)."]

[[solvers]]
id = "s2"

[[solvers]]
id = "s3"

[[links]]
a = "s1"
b = "s2"

[[links]]
a = "s2"
b = "s3"

[[sources]]
id = "d1"
solver = "s3"
fact = "location(Westwood)."

[[requests]]
id = "r1"
solver = "s1"
query = "loc(?X)"
"#;

    #[test]
    fn parses_scenario_with_defaults() {
        let cfg: ScenarioConfig = toml::from_str(
            r#"
[[solvers]]
id = "s1"

[[routes]]
solver = "s1"
key = "test/1"
neighbor = "s2"
"#,
        )
        .expect("config");
        assert_eq!(cfg.solver.announce_interval_ms, 200);
        assert_eq!(cfg.solver.link_capacity, 16);
        assert!(cfg.solvers[0].rules.is_empty());
        assert_eq!(cfg.routes[0].metric, 1);
        assert!(cfg.links.is_empty());
        assert_eq!(
            cfg.solver.solver_config().announce_interval,
            Duration::from_millis(200)
        );
    }

    #[test]
    fn loads_scenario_from_disk() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(WESTWOOD.as_bytes()).unwrap();
        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.solvers.len(), 3);
        assert_eq!(cfg.solvers[0].rules.len(), 2);
        assert_eq!(cfg.sources[0].fact, "location(Westwood).");
        assert_eq!(cfg.solver.settle_ms, 300);

        let missing = load_config(Path::new("/nonexistent/scenario.toml")).unwrap_err();
        assert!(missing.to_string().contains("reading scenario"));
    }

    #[test]
    fn outcome_json_shape() {
        let mut bindings = Bindings::new();
        bindings.insert("?X".into(), "Westwood".into());
        let outcome = RequestOutcome {
            request: "r1".into(),
            query: "loc(\"?X\")".into(),
            outcome: Outcome::Bound { bindings },
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "request": "r1",
                "query": "loc(\"?X\")",
                "status": "bound",
                "bindings": {"?X": "Westwood"}
            })
        );
    }

    #[tokio::test]
    async fn runs_westwood_scenario() {
        let cfg: ScenarioConfig = toml::from_str(WESTWOOD).unwrap();
        let outcomes = run_scenario(cfg).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        let mut expected = Bindings::new();
        expected.insert("?X".into(), "Westwood".into());
        assert_eq!(outcomes[0].request, "r1");
        assert_eq!(
            outcomes[0].outcome,
            Outcome::Bound { bindings: expected }
        );
    }

    #[tokio::test]
    async fn unanswerable_request_is_reported_stalled() {
        let cfg: ScenarioConfig = toml::from_str(
            r#"
[solver]
settle_ms = 10
answer_timeout_ms = 100

[[solvers]]
id = "s1"

[[requests]]
id = "r1"
solver = "s1"
query = "weather(?W)"
"#,
        )
        .unwrap();
        let outcomes = run_scenario(cfg).await.unwrap();
        assert_eq!(outcomes[0].outcome, Outcome::Stalled);
    }

    #[tokio::test]
    async fn rejects_unknown_solver_references() {
        let cfg: ScenarioConfig = toml::from_str(
            r#"
[[solvers]]
id = "s1"

[[links]]
a = "s1"
b = "s9"
"#,
        )
        .unwrap();
        let err = run_scenario(cfg).await.unwrap_err();
        assert!(err.to_string().contains("unknown solver `s9`"));

        let cfg: ScenarioConfig = toml::from_str(
            r#"
[[solvers]]
id = "s1"

[[solvers]]
id = "s1"
"#,
        )
        .unwrap();
        assert!(run_scenario(cfg).await.is_err());
    }
}
