//! In-sandbox launcher for `agent_main`-style Python agents.
//!
//! The harness is written into the run's `input/` directory together with the
//! agent sources. It locates everything through the environment allow-list, so
//! the same script works inside a container and in a local process group.

/// File name of the harness inside `input/`.
pub const HARNESS_FILE: &str = "harness.py";

/// Directory under `input/` that holds the agent module.
pub const AGENT_DIR: &str = "agent";

/// File name of the problem statement inside `input/`.
pub const PROBLEM_FILE: &str = "problem.md";

/// File name of the agent's structured output inside `output/`.
pub const OUTPUT_FILE: &str = "output.json";

/// Python harness that imports `agent` and calls `agent_main(input, repo_dir)`.
pub const HARNESS_PY: &str = r#"import json
import os
import sys
import traceback

workspace = os.environ["AGENT_WORKSPACE"]
input_dir = os.environ["AGENT_INPUT"]
output_dir = os.environ["AGENT_OUTPUT"]

with open(os.environ["PROBLEM_STATEMENT_FILE"], encoding="utf-8") as f:
    problem_statement = f.read()

sys.path.insert(0, os.path.join(input_dir, "agent"))
os.chdir(workspace)

input_dict = {
    "problem_statement": problem_statement,
    "run_id": os.environ.get("RUN_ID", ""),
    "inference_url": os.environ.get("INFERENCE_URL", ""),
    "proxy_url": os.environ.get("INFERENCE_URL", ""),
}

exit_code = 0
try:
    import agent
    if not hasattr(agent, "agent_main"):
        raise AttributeError("agent module does not define agent_main")
    result = agent.agent_main(input_dict, repo_dir=workspace)
    patch = None
    if isinstance(result, dict):
        patch = result.get("patch")
    elif isinstance(result, str):
        patch = result
    output = {"result": result, "patch": patch, "success": True}
except Exception as e:
    print(f"[ERROR] agent failed: {e}", file=sys.stderr)
    traceback.print_exc()
    output = {"error": str(e), "traceback": traceback.format_exc(), "success": False}
    exit_code = 1

with open(os.path.join(output_dir, "output.json"), "w", encoding="utf-8") as f:
    json.dump(output, f, indent=2, default=str)

sys.exit(exit_code)
"#;
