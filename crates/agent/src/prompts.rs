//! Prompt text sent to the completion service.

use std::fmt::Write as _;

use concierge_core::domain::truncate_chars;
use concierge_core::{Chunk, RunState, ToolCallRecord};

const ROUTER_CHUNK_PREVIEWS: usize = 3;
const ROUTER_CHUNK_PREVIEW_CHARS: usize = 150;
const ROUTER_ANSWER_PREVIEW_CHARS: usize = 200;

const ROUTER_RULES: &str = r#"**KEY DISTINCTION:**
- **RAG** = STATIC documents (policies, procedures, facts stored in markdown/PDF files)
- **TOOLS** = DYNAMIC data (calendar events, calculations, messages, current state that changes)

**Decision Rules (check in order):**

1. **'finalize'** -> Use when:
   - The query is answered (a final answer exists that addresses the query)
   - For static document queries: have chunks + answer -> finalize
   - For dynamic tool queries: have tool results + answer -> finalize
   - If tool calls exist AND a final answer exists -> ALWAYS finalize (don't call a tool again)
   - Detecting loops: the same tool called 2+ times with the same arguments -> finalize

2. **'tool'** -> Use when the query involves DYNAMIC data or actions:
   - Calendar queries (schedule, list events, "what's on my calendar", "book meeting")
   - Calculations (math, "calculate", "compute", "what is X * Y")
   - Sending a chat message
   - Any action that changes state or reads current/dynamic data
   - We already have chunks with formulas/data and need to calculate
   - ONLY if there are no tool calls yet, OR tool calls exist but no final answer yet
   - NOTE: even if the query uses "what" or "list", if it is about calendar/events -> tool

3. **'rag'** -> Use when the query needs a STATIC document lookup:
   - Policies, procedures, definitions ("what is", "how much allowance", "explain policy")
   - Historical facts stored in documents
   - Formulas/procedures documented in files
   - ONLY if there are no retrieved chunks yet

**Examples:**
- "What is the overtime rate?" -> 'rag' (static policy document)
- "What events are on my calendar?" -> 'tool' (dynamic calendar data, not in documents)
- "Schedule a meeting" -> 'tool' (action on the calendar)
- "Overtime pay for 3 hours?" -> with no chunks: 'rag' (get the formula); with chunks: 'tool' (calculate)
- "Calculate 10 * 5" -> 'tool' (pure math, no lookup needed)
- "What's the relocation allowance?" -> 'rag' (static document fact)

**Critical:**
- Calendar/events queries ALWAYS go to 'tool', never 'rag' (the calendar is not in the documents)
- "What is" questions can be either: about documents -> rag, about the calendar/current state -> tool

Only reply with one word: either 'rag' or 'tool' or 'finalize'."#;

/// System prompt for the routing decision, summarising what the run has gathered so far.
pub fn router_system_prompt(state: &RunState) -> String {
    let has_chunks = !state.retrieved_chunks().is_empty();
    let has_answer = state.has_answer();
    let has_tool_calls = !state.tool_calls().is_empty();

    let mut prompt = String::from(
        "You are a routing model that decides the next step for handling the user's query.\n\n",
    );
    let _ = writeln!(prompt, "**Current State:**");
    let _ = writeln!(prompt, "- Has retrieved chunks (RAG called): {has_chunks}");
    let _ = writeln!(prompt, "- Has final answer: {has_answer}");
    let _ = writeln!(prompt, "- Has tool calls: {has_tool_calls}\n");

    if has_chunks {
        let _ = writeln!(prompt, "Retrieved chunks summary:");
        for chunk in state.retrieved_chunks().iter().take(ROUTER_CHUNK_PREVIEWS) {
            let _ = writeln!(
                prompt,
                "- {}: {}...",
                chunk.source,
                truncate_chars(&chunk.content, ROUTER_CHUNK_PREVIEW_CHARS)
            );
        }
        prompt.push('\n');
    }
    if let Some(answer) = state.final_answer().filter(|_| has_answer) {
        let _ = writeln!(
            prompt,
            "Final answer so far: {}...\n",
            truncate_chars(answer, ROUTER_ANSWER_PREVIEW_CHARS)
        );
    }
    if has_tool_calls {
        let _ = writeln!(prompt, "Tool calls made: {} call(s)\n", state.tool_calls().len());
    }

    prompt.push_str(ROUTER_RULES);
    prompt
}

pub fn router_user_prompt(query: &str) -> String {
    format!("User query: {query}")
}

pub const GROUNDED_ANSWER_SYSTEM: &str = "You are a helpful assistant that answers questions based \
ONLY on the provided documents. Always cite your sources.";

pub fn grounded_answer_prompt(query: &str, chunks: &[Chunk]) -> String {
    let context = chunks
        .iter()
        .map(|chunk| format!("Document: {}\n{}", chunk.source, chunk.content))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Based on the following retrieved documents, answer the question.\n\
         If the answer cannot be found in the documents, say so.\n\n\
         Documents:\n{context}\n\n\
         Question: {query}\n\n\
         Answer (cite sources using [Source: filename]):"
    )
}

/// ReAct instructions for the tool loop. `tool_names` is the comma-separated registry listing.
pub fn react_system_prompt(tool_names: &str) -> String {
    format!(
        "Answer the following questions as best you can. You have access to the following tools:\n\n\
         {tool_names}\n\n\
         Use the following format:\n\n\
         Question: the input question you must answer\n\
         Thought: you should always think about what to do\n\
         Action: the action to take, should be one of [{tool_names}]\n\
         Action Input: the input to the action\n\
         Observation: the result of the action\n\
         ... (this Thought/Action/Action Input/Observation can repeat N times)\n\
         Thought: I now know the final answer\n\
         Final Answer: the final answer to the original input question\n\n\
         Begin!"
    )
}

pub fn react_user_prompt(query: &str, scratchpad: &str) -> String {
    format!("Question: {query}\nThought:{scratchpad}")
}

pub const SYNTHESIS_SYSTEM: &str =
    "You are a helpful assistant that answers questions based ONLY on the provided tools.";

/// Asks for an answer built from the run's tool-call log.
pub fn synthesis_prompt(query: &str, tool_calls: &[ToolCallRecord]) -> String {
    let mut log = String::new();
    for (position, call) in tool_calls.iter().enumerate() {
        let _ = writeln!(
            log,
            "{}. {}({}) -> {}",
            position + 1,
            call.name,
            serde_json::Value::Object(call.arguments.clone()),
            call.result.to_text()
        );
    }
    format!(
        "You are given a question and a list of tool calls.\n\
         You need to use the tool calls to answer the question.\n\
         Tool calls:\n{log}\
         Question: {query}\n\
         Answer: "
    )
}
