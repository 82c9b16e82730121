use clap::Parser;
use serde::Serialize;
use std::io::{BufRead, Write};

use inkrun::{ErrorType, Story};

#[derive(Parser)]
#[command(name = "inkrun")]
#[command(about = "Play a compiled Ink JSON story")]
#[command(version)]
struct Cli {
    /// Path to the compiled .ink.json story
    story: String,

    /// Comma-separated 1-based choice indices to take non-interactively
    #[arg(long = "choices")]
    choices: Option<String>,

    /// Output the session as JSON records (lines, tags, choices)
    #[arg(long = "json")]
    json: bool,

    /// Load a saved state before playing
    #[arg(long = "state")]
    state: Option<String>,

    /// Save the state to a file when the session ends
    #[arg(long = "save")]
    save: Option<String>,

    /// Seed the story's RNG for reproducible runs
    #[arg(long = "seed")]
    seed: Option<i32>,
}

/// One step of a `--json` transcript.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum TranscriptRecord {
    Line { text: String, tags: Vec<String> },
    Choices { options: Vec<String> },
    Chosen { index: usize },
    End,
}

fn main() {
    let cli = Cli::parse();
    if let Err(message) = run(&cli) {
        eprintln!("Error: {}", message);
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), String> {
    let json_text = std::fs::read_to_string(&cli.story)
        .map_err(|e| format!("Cannot read story file: {}: {}", cli.story, e))?;

    let mut story = Story::new(&json_text).map_err(|e| e.to_string())?;
    story.set_error_handler(|message, error_type| match error_type {
        ErrorType::Warning => eprintln!("[warning] {}", message),
        _ => eprintln!("[error] {}", message),
    });

    if let Some(state_path) = &cli.state {
        let state_text = std::fs::read_to_string(state_path)
            .map_err(|e| format!("Cannot read state file: {}: {}", state_path, e))?;
        story.load_state_json(&state_text).map_err(|e| e.to_string())?;
    }

    if let Some(seed) = cli.seed {
        seed_story(&mut story, seed)?;
    }

    let scripted: Option<Vec<usize>> = match &cli.choices {
        Some(spec) => Some(parse_choice_script(spec)?),
        None => None,
    };

    let mut records: Vec<TranscriptRecord> = Vec::new();
    play(&mut story, scripted, cli.json, &mut records)?;

    if cli.json {
        records.push(TranscriptRecord::End);
        let out = serde_json::to_string_pretty(&records).map_err(|e| e.to_string())?;
        println!("{}", out);
    }

    if let Some(save_path) = &cli.save {
        std::fs::write(save_path, story.state_to_json())
            .map_err(|e| format!("Cannot write state file: {}: {}", save_path, e))?;
    }

    Ok(())
}

fn play(
    story: &mut Story,
    scripted: Option<Vec<usize>>,
    json_mode: bool,
    records: &mut Vec<TranscriptRecord>,
) -> Result<(), String> {
    let mut scripted = scripted.map(|choices| choices.into_iter());
    loop {
        while story.can_continue() {
            let line = story.cont().map_err(|e| e.to_string())?;
            let tags = story.current_tags().map_err(|e| e.to_string())?;
            if json_mode {
                records.push(TranscriptRecord::Line { text: line, tags });
            } else {
                print!("{}", line);
                for tag in tags {
                    println!("  # {}", tag);
                }
            }
        }

        let choices = story.current_choices();
        if choices.is_empty() {
            break;
        }

        if json_mode || scripted.is_some() {
            if json_mode {
                records.push(TranscriptRecord::Choices {
                    options: choices.iter().map(|c| c.text.clone()).collect(),
                });
            }
            let next = scripted.as_mut().and_then(|it| it.next());
            let Some(index) = next else {
                // Script exhausted; stop at the choice point.
                break;
            };
            if index == 0 || index > choices.len() {
                return Err(format!("choice {} out of range (1-{})", index, choices.len()));
            }
            if json_mode {
                records.push(TranscriptRecord::Chosen { index });
            }
            story.choose_choice_index(index - 1).map_err(|e| e.to_string())?;
            continue;
        }

        println!("\nChoices:");
        for (i, choice) in choices.iter().enumerate() {
            println!("  {}) {}", i + 1, choice.text);
        }

        let selection = loop {
            print!("\nChoose 1-{} (or 'q' to quit): ", choices.len());
            std::io::stdout().flush().map_err(|e| e.to_string())?;
            let mut input = String::new();
            std::io::stdin()
                .lock()
                .read_line(&mut input)
                .map_err(|e| e.to_string())?;
            let input = input.trim();
            if input.eq_ignore_ascii_case("q") || input.eq_ignore_ascii_case("quit") {
                println!("\n--- Quit ---");
                return Ok(());
            }
            match input.parse::<usize>() {
                Ok(n) if n >= 1 && n <= choices.len() => break n,
                _ => println!("Invalid choice. Try again."),
            }
        };
        story
            .choose_choice_index(selection - 1)
            .map_err(|e| e.to_string())?;
    }

    if !json_mode {
        println!("\n--- The End ---");
    }
    Ok(())
}

fn parse_choice_script(spec: &str) -> Result<Vec<usize>, String> {
    spec.split(',')
        .map(|part| {
            part.trim()
                .parse::<usize>()
                .map_err(|_| format!("bad choice index '{}' in --choices", part))
        })
        .collect()
}

/// Set the story seed by rewriting the state JSON, the same fields a save
/// file carries.
fn seed_story(story: &mut Story, seed: i32) -> Result<(), String> {
    let mut state: serde_json::Value =
        serde_json::from_str(&story.state_to_json()).map_err(|e| e.to_string())?;
    if let Some(obj) = state.as_object_mut() {
        obj.insert("storySeed".to_string(), serde_json::json!(seed));
        obj.insert("previousRandom".to_string(), serde_json::json!(0));
    }
    story
        .load_state_json(&state.to_string())
        .map_err(|e| e.to_string())
}
