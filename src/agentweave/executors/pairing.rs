//! Two-agent collaboration executors: pair programming and teacher-student.
//!
//! Both run a fixed number of alternations between two agents.  In pair
//! programming the driver produces work and the navigator reviews it; in
//! teacher-student the student attempts the objective and the teacher
//! critiques.  The merged output is the last producing agent's output
//! (driver / student respectively).

use std::collections::HashMap;
use std::time::Instant;

use crate::agentweave::agent_api::BoxError;
use crate::agentweave::orchestrator::{Orchestrator, WorkflowError};
use crate::agentweave::pattern::{PairProgrammingPattern, TeacherStudentPattern};
use crate::agentweave::result::{AgentResult, WorkflowCost, WorkflowResult};

use super::{invoke_agent, new_workflow_id, session_id};

pub async fn execute_pair(
    orchestrator: &Orchestrator,
    pattern: &PairProgrammingPattern,
) -> Result<WorkflowResult, BoxError> {
    if pattern.rounds == 0 {
        return Err(Box::new(WorkflowError::InvalidPattern(format!(
            "pair programming '{}' has zero rounds",
            pattern.name
        ))));
    }
    orchestrator
        .require_agents(&[pattern.driver_id.clone(), pattern.navigator_id.clone()])
        .await?;

    let workflow_id = new_workflow_id("pair_programming");
    let mut span = orchestrator.tracer().start_span("workflow.pair_programming");
    span.set_attribute("workflow_id", &workflow_id);

    let started = Instant::now();
    let mut results: Vec<AgentResult> = Vec::new();
    let mut cost = WorkflowCost::default();
    let mut models_used = HashMap::new();
    let mut last_driver_output = String::new();
    let mut last_review = String::new();

    orchestrator.emit_progress(
        "pair_programming",
        &format!("{} driver/navigator rounds", pattern.rounds),
        20.0,
        Some(&pattern.driver_id),
        &results,
    );

    let driver = orchestrator.require_agent(&pattern.driver_id).await?;
    let navigator = orchestrator.require_agent(&pattern.navigator_id).await?;
    models_used.insert(pattern.driver_id.clone(), driver.llm_model().to_string());
    models_used.insert(pattern.navigator_id.clone(), navigator.llm_model().to_string());

    for round in 1..=pattern.rounds {
        let driver_prompt = if round == 1 {
            format!("Task: {}\n\nProduce your best implementation.", pattern.task)
        } else {
            format!(
                "Task: {}\n\nYour previous work:\n{}\n\nNavigator feedback:\n{}\n\n\
                 Revise your work to address the feedback.",
                pattern.task, last_driver_output, last_review
            )
        };
        let session = session_id(&workflow_id, &format!("driver-r{}", round), &pattern.driver_id);
        let driver_result = invoke_agent(&driver, &pattern.driver_id, &session, &driver_prompt)
            .await
            .with_metadata("round", round.to_string())
            .with_metadata("role", "driver".to_string());
        cost.absorb(&driver_result);
        if driver_result.is_error() {
            span.end();
            return Err(Box::new(WorkflowError::ExecutionFailed(format!(
                "pair programming '{}' round {}: driver '{}' failed",
                pattern.name, round, pattern.driver_id
            ))));
        }
        last_driver_output = driver_result.output.clone();
        results.push(driver_result);

        let navigator_prompt = format!(
            "Task: {}\n\nThe driver produced:\n{}\n\n\
             Review the work: point out defects, risks, and concrete improvements.",
            pattern.task, last_driver_output
        );
        let session = session_id(
            &workflow_id,
            &format!("navigator-r{}", round),
            &pattern.navigator_id,
        );
        let navigator_result =
            invoke_agent(&navigator, &pattern.navigator_id, &session, &navigator_prompt)
                .await
                .with_metadata("round", round.to_string())
                .with_metadata("role", "navigator".to_string());
        cost.absorb(&navigator_result);
        if navigator_result.is_error() {
            log::warn!(
                "pair programming '{}' round {}: navigator '{}' failed, keeping driver output",
                pattern.name,
                round,
                pattern.navigator_id
            );
            results.push(navigator_result);
            break;
        }
        last_review = navigator_result.output.clone();
        results.push(navigator_result);
    }

    let mut metadata = HashMap::new();
    metadata.insert("rounds".to_string(), pattern.rounds.to_string());
    metadata.insert("driver".to_string(), pattern.driver_id.clone());
    metadata.insert("navigator".to_string(), pattern.navigator_id.clone());

    span.end();
    Ok(WorkflowResult {
        pattern_type: "pair_programming".to_string(),
        agent_results: results,
        merged_output: last_driver_output,
        metadata,
        duration_ms: started.elapsed().as_millis() as u64,
        cost,
        models_used,
    })
}

pub async fn execute_teacher_student(
    orchestrator: &Orchestrator,
    pattern: &TeacherStudentPattern,
) -> Result<WorkflowResult, BoxError> {
    if pattern.rounds == 0 {
        return Err(Box::new(WorkflowError::InvalidPattern(format!(
            "teacher-student '{}' has zero rounds",
            pattern.name
        ))));
    }
    orchestrator
        .require_agents(&[pattern.teacher_id.clone(), pattern.student_id.clone()])
        .await?;

    let workflow_id = new_workflow_id("teacher_student");
    let mut span = orchestrator.tracer().start_span("workflow.teacher_student");
    span.set_attribute("workflow_id", &workflow_id);

    let started = Instant::now();
    let mut results: Vec<AgentResult> = Vec::new();
    let mut cost = WorkflowCost::default();
    let mut models_used = HashMap::new();
    let mut last_attempt = String::new();
    let mut last_critique = String::new();

    orchestrator.emit_progress(
        "teacher_student",
        &format!("{} attempt/critique rounds", pattern.rounds),
        20.0,
        Some(&pattern.student_id),
        &results,
    );

    let teacher = orchestrator.require_agent(&pattern.teacher_id).await?;
    let student = orchestrator.require_agent(&pattern.student_id).await?;
    models_used.insert(pattern.teacher_id.clone(), teacher.llm_model().to_string());
    models_used.insert(pattern.student_id.clone(), student.llm_model().to_string());

    for round in 1..=pattern.rounds {
        let student_prompt = if round == 1 {
            format!("Objective: {}\n\nMake your best attempt.", pattern.objective)
        } else {
            format!(
                "Objective: {}\n\nYour previous attempt:\n{}\n\nTeacher critique:\n{}\n\n\
                 Produce an improved attempt that addresses the critique.",
                pattern.objective, last_attempt, last_critique
            )
        };
        let session = session_id(&workflow_id, &format!("student-r{}", round), &pattern.student_id);
        let student_result = invoke_agent(&student, &pattern.student_id, &session, &student_prompt)
            .await
            .with_metadata("round", round.to_string())
            .with_metadata("role", "student".to_string());
        cost.absorb(&student_result);
        if student_result.is_error() {
            span.end();
            return Err(Box::new(WorkflowError::ExecutionFailed(format!(
                "teacher-student '{}' round {}: student '{}' failed",
                pattern.name, round, pattern.student_id
            ))));
        }
        last_attempt = student_result.output.clone();
        results.push(student_result);

        let teacher_prompt = format!(
            "Objective: {}\n\nThe student's attempt:\n{}\n\n\
             Critique the attempt: what is wrong, what is missing, what should change.",
            pattern.objective, last_attempt
        );
        let session = session_id(&workflow_id, &format!("teacher-r{}", round), &pattern.teacher_id);
        let teacher_result = invoke_agent(&teacher, &pattern.teacher_id, &session, &teacher_prompt)
            .await
            .with_metadata("round", round.to_string())
            .with_metadata("role", "teacher".to_string());
        cost.absorb(&teacher_result);
        if teacher_result.is_error() {
            log::warn!(
                "teacher-student '{}' round {}: teacher '{}' failed, keeping student attempt",
                pattern.name,
                round,
                pattern.teacher_id
            );
            results.push(teacher_result);
            break;
        }
        last_critique = teacher_result.output.clone();
        results.push(teacher_result);
    }

    let mut metadata = HashMap::new();
    metadata.insert("rounds".to_string(), pattern.rounds.to_string());
    metadata.insert("teacher".to_string(), pattern.teacher_id.clone());
    metadata.insert("student".to_string(), pattern.student_id.clone());

    span.end();
    Ok(WorkflowResult {
        pattern_type: "teacher_student".to_string(),
        agent_results: results,
        merged_output: last_attempt,
        metadata,
        duration_ms: started.elapsed().as_millis() as u64,
        cost,
        models_used,
    })
}
