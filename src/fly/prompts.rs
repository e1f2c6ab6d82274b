//! First-iteration execution prompt and the executor system prompt.

use std::path::Path;

use crate::domain::Waypoint;
use crate::git::{Checklist, safe_receipt_id};

const SPEC_EXCERPT_CHARS: usize = 2000;

/// Full prompt sent on iteration 1
pub fn build_execution_prompt(waypoint: &Waypoint, spec: &str, project_path: &Path, checklist: &Checklist) -> String {
    let criteria_list = waypoint
        .acceptance_criteria
        .iter()
        .enumerate()
        .map(|(i, c)| format!("- [ ] [{}] {}", i, c))
        .collect::<Vec<_>>()
        .join("\n");

    let mut spec_excerpt: String = spec.chars().take(SPEC_EXCERPT_CHARS).collect();
    if spec.chars().count() > SPEC_EXCERPT_CHARS {
        spec_excerpt.push_str("...");
    }

    format!(
        "## Current Waypoint: {id}\n\
         {title}\n\n\
         ## Objective\n\
         {objective}\n\n\
         ## Acceptance Criteria (must all pass)\n\
         {criteria_list}\n\n\
         ## Product Spec Summary\n\
         {spec_excerpt}\n\n\
         ## Working Directory\n\
         {path}\n\n\
         ## Instructions\n\
         You are implementing a software waypoint. Your task is to:\n\n\
         1. Read any existing code in the project to understand the codebase\n\
         2. Create/modify code files to achieve the waypoint objective\n\
         3. Write tests that verify the acceptance criteria\n\
         4. Run the test suite and ensure it passes\n\
         5. If tests fail, analyze the failure and fix the code\n\
         6. Iterate until all acceptance criteria are met\n\n\
         **CRITICAL SAFETY RULES:**\n\
         - Only read/write files within {path}\n\
         - NEVER access parent directories with ../ to escape the project\n\
         - All file operations MUST be relative to the project root\n\n\
         ## Pre-Completion Checklist\n\
         {checklist}\n\
         ## Protocol\n\n\
         Report each stage of your work as JSON:\n\
         <execution-stage>{{\"stage\": \"analyze|plan|test|code|run|fix|lint|report\", \"success\": true, \
         \"output\": \"what happened\", \"artifacts\": [\"files\"], \"next_stage\": \"...\"}}</execution-stage>\n\n\
         Report each validation command you run:\n\
         <validation><command>the exact command</command><exit-code>0</exit-code><output>relevant output</output></validation>\n\n\
         Report each acceptance criterion once verified (or failed):\n\
         <acceptance-criterion><index>N</index><status>verified|failed</status><text>criterion text</text>\
         <evidence>files, tests and command output that prove it</evidence></acceptance-criterion>\n\n\
         If intent is ambiguous and blocks progress, ask instead of guessing:\n\
         <clarification-request>{{\"question\": \"...\", \"context\": \"...\", \"confidence\": 0.5, \
         \"options\": [\"...\"]}}</clarification-request>\n\n\
         Receipts are written to receipts/{safe_id}-<timestamp>.json from the validation evidence above.\n\n\
         **COMPLETION SIGNAL:**\n\
         When ALL acceptance criteria are met and validation checks pass, output exactly:\n\
         {marker}\n\n\
         Only output the completion marker when you are confident the waypoint is done.\n\
         If you cannot complete the waypoint after several attempts, explain what's blocking you.\n\n\
         Begin implementing this waypoint now.\n",
        id = waypoint.id,
        title = waypoint.title,
        objective = waypoint.objective,
        path = project_path.display(),
        checklist = checklist.to_prompt(),
        safe_id = safe_receipt_id(&waypoint.id),
        marker = waypoint.completion_marker(),
    )
}

/// System prompt for every builder turn
pub fn build_system_prompt(project_path: &Path, directory_policy_context: Option<&str>) -> String {
    let policy = directory_policy_context
        .filter(|p| !p.trim().is_empty())
        .map(|p| format!("\nProject memory policy (generated from repository scan):\n{}\n", p))
        .unwrap_or_default();

    format!(
        "You are implementing a software waypoint as part of a larger project.\n\
         You have access to file and bash tools to read, write, and execute code.\n\n\
         **CRITICAL CONSTRAINTS:**\n\
         - Your working directory is: {path}\n\
         - ONLY access files within this directory\n\
         - NEVER use absolute paths outside the project\n\
         - NEVER use ../ to escape the project directory\n\
         {policy}\n\
         Work methodically:\n\
         1. First understand the existing codebase\n\
         2. Make minimal, focused changes\n\
         3. Test after each change\n\
         4. Iterate until done\n\n\
         When complete, output the completion marker specified in the instructions.",
        path = project_path.display(),
    )
}
