use anyhow::{anyhow, bail, Result};
use beatfeed_core::models::{AudioUpload, Comment, Post};
use beatfeed_core::mutator::{Confirmation, DeleteOutcome, Engagement, LikeState, LikeView};
use beatfeed_core::session::{Authenticator, SessionSource, SignUpOutcome};
use beatfeed_core::{FeedSnapshot, FeedSync};
use std::io::{self, Write};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::task::JoinHandle;

/// Run the interactive shell until `exit` or end of input.
pub async fn run_shell(sync: FeedSync) -> Result<()> {
    let notices = spawn_feed_notices(&sync);
    let mut session = ShellSession {
        sync,
        lines: BufReader::new(tokio::io::stdin()).lines(),
    };

    println!("Beatfeed shell ready. Type 'help' for a list of commands.");

    loop {
        print!("beatfeed> ");
        io::stdout().flush()?;

        let Some(line) = session.lines.next_line().await? else {
            println!("Exiting");
            break;
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let tokens = match shell_words::split(trimmed) {
            Ok(tokens) if !tokens.is_empty() => tokens,
            Ok(_) => continue,
            Err(err) => {
                println!("Unable to parse command: {err}");
                continue;
            }
        };

        match session.handle_command(&tokens).await {
            Ok(LoopAction::Continue) => {}
            Ok(LoopAction::Exit) => break,
            Err(err) => {
                println!("Error: {err:#}");
            }
        }
    }

    notices.abort();
    session.sync.shutdown().await;
    Ok(())
}

/// Prints a one-line notice whenever a refetch replaces the feed.
fn spawn_feed_notices(sync: &FeedSync) -> JoinHandle<()> {
    let mut updates = sync.cache().subscribe();
    tokio::spawn(async move {
        let mut seen = updates.borrow_and_update().generation;
        while updates.changed().await.is_ok() {
            let snapshot = updates.borrow_and_update().clone();
            if snapshot.generation != seen {
                seen = snapshot.generation;
                println!("\n[feed updated: {} posts]", snapshot.posts.len());
            } else if let Some(error) = &snapshot.error {
                println!("\n[feed may be stale: {error}]");
            }
        }
    })
}

struct ShellSession {
    sync: FeedSync,
    lines: Lines<BufReader<Stdin>>,
}

enum LoopAction {
    Continue,
    Exit,
}

impl ShellSession {
    async fn handle_command(&mut self, tokens: &[String]) -> Result<LoopAction> {
        let command = tokens[0].as_str();
        match command {
            "help" => {
                print_help();
            }
            "signup" | "register" => {
                if tokens.len() < 4 {
                    println!("Usage: signup <email> <password> <display name>");
                    return Ok(LoopAction::Continue);
                }
                let display_name = tokens[3..].join(" ");
                match self
                    .sync
                    .auth()
                    .sign_up(&tokens[1], &tokens[2], &display_name)
                    .await?
                {
                    SignUpOutcome::SignedIn(session) => {
                        println!("Welcome, {display_name}! Signed in as {}", session.user_id);
                    }
                    SignUpOutcome::ConfirmationRequired => {
                        println!("Check your email to confirm the account, then log in.");
                    }
                }
            }
            "login" | "signin" => {
                if tokens.len() < 3 {
                    println!("Usage: login <email> <password>");
                    return Ok(LoopAction::Continue);
                }
                let session = self.sync.auth().sign_in(&tokens[1], &tokens[2]).await?;
                println!(
                    "Signed in as {}",
                    session.email.as_deref().unwrap_or(&session.user_id)
                );
            }
            "logout" | "signout" => {
                self.sync.auth().sign_out().await?;
                println!("Signed out.");
            }
            "reset-password" => {
                let Some(email) = tokens.get(1) else {
                    println!("Usage: reset-password <email>");
                    return Ok(LoopAction::Continue);
                };
                self.sync.auth().request_password_reset(email).await?;
                println!("Password reset email sent. Run 'recover {email} <code>' with the code from it, then set-password.");
            }
            "recover" => {
                if tokens.len() < 3 {
                    println!("Usage: recover <email> <code>");
                    return Ok(LoopAction::Continue);
                }
                let session = self.sync.auth().verify_recovery(&tokens[1], &tokens[2]).await?;
                println!(
                    "Code accepted for {}. Choose a new password with set-password.",
                    session.email.as_deref().unwrap_or(&session.user_id)
                );
            }
            "set-password" => {
                if tokens.len() < 3 {
                    println!("Usage: set-password <new password> <confirm password>");
                    return Ok(LoopAction::Continue);
                }
                self.sync.auth().update_password(&tokens[1], &tokens[2]).await?;
                println!("Password updated.");
            }
            "whoami" => match self.sync.session().current() {
                Some(session) => println!(
                    "{} ({})",
                    session.email.as_deref().unwrap_or("no email"),
                    session.user_id
                ),
                None => println!("Not signed in."),
            },
            "feed" | "posts" => {
                let limit = tokens
                    .get(1)
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(20);
                self.print_feed(limit).await;
            }
            "refresh" => {
                let snapshot = self.sync.cache().refetch().await?;
                println!("Loaded {} posts.", snapshot.posts.len());
            }
            "post" => {
                let (content, audio) = parse_post_args(&tokens[1..])?;
                let upload = match audio {
                    Some(path) => Some(AudioUpload::from_path(&path).await?),
                    None => None,
                };
                self.sync.mutator().create_post(&content, upload).await?;
                println!("Posted.");
            }
            "like" | "unlike" => {
                let post = self.resolve_post(tokens.get(1))?;
                let toggle = self.sync.mutator().toggle_like(&post.id)?;
                print_like(&toggle.optimistic);
                toggle.settled().await?;
            }
            "comments" | "view" => {
                let post = self.resolve_post(tokens.get(1))?;
                let engagement = self.sync.mutator().load_engagement(&post.id).await?;
                print_post(0, &post);
                print_engagement(&engagement);
            }
            "comment" => {
                if tokens.len() < 3 {
                    println!("Usage: comment <post> \"message\"");
                    return Ok(LoopAction::Continue);
                }
                let post = self.resolve_post(tokens.get(1))?;
                let text = tokens[2..].join(" ");
                let engagement = self.sync.mutator().add_comment(&post.id, &text).await?;
                print_engagement(&engagement);
            }
            "delete-comment" => {
                if tokens.len() < 3 {
                    println!("Usage: delete-comment <post> <comment number or id>");
                    return Ok(LoopAction::Continue);
                }
                let post = self.resolve_post(tokens.get(1))?;
                let engagement = self.sync.mutator().load_engagement(&post.id).await?;
                let comment = resolve_comment(&engagement.comments, &tokens[2])?;
                if !self.sync.mutator().can_delete_comment(&comment) {
                    bail!("only the author can delete this comment");
                }
                let confirmation = self.confirm("Delete this comment?").await?;
                let outcome = self
                    .sync
                    .mutator()
                    .delete_comment(&post.id, &comment.id, confirmation)
                    .await?;
                print_delete_outcome(outcome, "Comment");
            }
            "delete-post" => {
                let post = self.resolve_post(tokens.get(1))?;
                if !self.sync.mutator().can_delete_post(&post) {
                    bail!("only the author can delete this post");
                }
                let confirmation = self.confirm("Delete this post?").await?;
                let outcome = self
                    .sync
                    .mutator()
                    .delete_post(&post.id, confirmation)
                    .await?;
                print_delete_outcome(outcome, "Post");
            }
            "quit" | "exit" => return Ok(LoopAction::Exit),
            "clear" => {
                print!("\x1B[2J\x1B[1;1H");
            }
            other => {
                println!("Unknown command '{other}'. Type 'help' for a list of commands.");
            }
        }
        Ok(LoopAction::Continue)
    }

    /// Lists posts with their like and comment counts. Panels loaded here
    /// stay fresh through the sync core afterwards.
    async fn print_feed(&self, limit: usize) {
        let snapshot = self.sync.cache().current();
        print_feed_status(&snapshot);
        let mutator = self.sync.mutator();
        for (index, post) in snapshot.posts.iter().take(limit).enumerate() {
            print_post(index + 1, post);
            let mut engagement = mutator.engagement(&post.id);
            if !engagement.loaded {
                match mutator.load_engagement(&post.id).await {
                    Ok(loaded) => engagement = loaded,
                    Err(err) => {
                        tracing::debug!(post_id = %post.id, error = %err, "no engagement for post");
                        continue;
                    }
                }
            }
            let mine = if engagement.like.liked() { ", liked by you" } else { "" };
            println!(
                "     {} like(s), {} comment(s){mine}",
                engagement.like.count,
                engagement.comments.len()
            );
        }
    }

    /// Accepts a feed position (`3`) or a post id prefix.
    fn resolve_post(&self, token: Option<&String>) -> Result<Post> {
        let token = token.ok_or_else(|| anyhow!("missing post number or id"))?;
        let snapshot = self.sync.cache().current();
        if let Ok(index) = token.parse::<usize>() {
            return index
                .checked_sub(1)
                .and_then(|i| snapshot.posts.get(i))
                .cloned()
                .ok_or_else(|| anyhow!("no post at position {index}; run 'feed' to list posts"));
        }
        let mut matches = snapshot.posts.iter().filter(|post| post.id.starts_with(token.as_str()));
        match (matches.next(), matches.next()) {
            (Some(post), None) => Ok(post.clone()),
            (Some(_), Some(_)) => bail!("post id prefix '{token}' is ambiguous"),
            (None, _) => bail!("unknown post '{token}'"),
        }
    }

    async fn confirm(&mut self, question: &str) -> Result<Confirmation> {
        print!("{question} [y/N] ");
        io::stdout().flush()?;
        let answer = self.lines.next_line().await?.unwrap_or_default();
        Ok(match answer.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => Confirmation::Confirmed,
            _ => Confirmation::Declined,
        })
    }
}

fn parse_post_args(args: &[String]) -> Result<(String, Option<PathBuf>)> {
    let mut words = Vec::new();
    let mut audio = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--audio" {
            let path = iter
                .next()
                .ok_or_else(|| anyhow!("--audio needs a file path"))?;
            audio = Some(PathBuf::from(path));
        } else {
            words.push(arg.as_str());
        }
    }
    if words.is_empty() {
        bail!("Usage: post \"message\" [--audio <file>]");
    }
    Ok((words.join(" "), audio))
}

fn resolve_comment(comments: &[Comment], token: &str) -> Result<Comment> {
    if let Ok(index) = token.parse::<usize>() {
        return index
            .checked_sub(1)
            .and_then(|i| comments.get(i))
            .cloned()
            .ok_or_else(|| anyhow!("no comment at position {index}"));
    }
    comments
        .iter()
        .find(|comment| comment.id.starts_with(token))
        .cloned()
        .ok_or_else(|| anyhow!("unknown comment '{token}'"))
}

fn print_like(like: &LikeView) {
    let label = match like.state {
        LikeState::Liked => "Liked",
        LikeState::Unliked => "Unliked",
    };
    println!("{label} ({} like(s))", like.count);
}

fn print_feed_status(snapshot: &FeedSnapshot) {
    if snapshot.is_loading() {
        println!("Loading feed...");
    }
    if let Some(error) = &snapshot.error {
        println!("Showing cached posts; last refresh failed: {error}");
    }
    if snapshot.posts.is_empty() && !snapshot.fetching {
        println!("No posts yet. Be the first to share something!");
    }
}

pub fn print_post(position: usize, post: &Post) {
    let when = post
        .created_at
        .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "just now".to_string());
    let short_id: String = post.id.chars().take(8).collect();
    if position > 0 {
        println!("[{position}] {} · {when} · {short_id}", post.author_name());
    } else {
        println!("{} · {when} · {short_id}", post.author_name());
    }
    println!("     {}", post.content);
    if let Some(audio) = &post.audio_url {
        println!("     ♪ {audio}");
    }
}

fn print_engagement(engagement: &Engagement) {
    let like = &engagement.like;
    print_like(like);
    if let Some(error) = &like.error {
        println!("  last like failed: {error}");
    }
    if engagement.comments.is_empty() {
        println!("  No comments yet.");
    }
    for (index, comment) in engagement.comments.iter().enumerate() {
        println!(
            "  {}. {}: {} ({})",
            index + 1,
            comment.author_name(),
            comment.content,
            comment.created_at.format("%Y-%m-%d %H:%M")
        );
    }
}

fn print_delete_outcome(outcome: DeleteOutcome, what: &str) {
    match outcome {
        DeleteOutcome::Deleted => println!("{what} deleted."),
        DeleteOutcome::Declined => println!("Kept."),
    }
}

fn print_help() {
    println!("Available commands:");
    println!("  help                          Show this help message");
    println!("  signup EMAIL PASSWORD NAME    Create an account");
    println!("  login EMAIL PASSWORD          Sign in");
    println!("  logout                        Sign out");
    println!("  reset-password EMAIL          Email a password reset code");
    println!("  recover EMAIL CODE            Sign in with the code from the reset email");
    println!("  set-password NEW CONFIRM      Set a new password once recovered or signed in");
    println!("  whoami                        Show the signed-in account");
    println!("  feed [N]                      List the newest posts (default 20)");
    println!("  refresh                       Reload the feed now");
    println!("  post MSG [--audio FILE]       Share a post with an optional audio file");
    println!("  like <post>                   Toggle your like on a post");
    println!("  comments <post>               Show likes and comments of a post");
    println!("  comment <post> MSG            Comment on a post");
    println!("  delete-comment <post> <n>     Delete one of your comments");
    println!("  delete-post <post>            Delete one of your posts");
    println!("  clear                         Clear the screen");
    println!("  exit                          Leave the shell");
    println!("Posts are addressed by their number in 'feed' or an id prefix.");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(raw: &str) -> Vec<String> {
        shell_words::split(raw).unwrap()
    }

    #[test]
    fn post_args_pick_up_audio_anywhere() {
        let (content, audio) = parse_post_args(&words("\"new loop\" --audio ./beat.wav")).unwrap();
        assert_eq!(content, "new loop");
        assert_eq!(audio, Some(PathBuf::from("./beat.wav")));

        let (content, audio) = parse_post_args(&words("just words here")).unwrap();
        assert_eq!(content, "just words here");
        assert_eq!(audio, None);
    }

    #[test]
    fn post_args_require_a_message() {
        assert!(parse_post_args(&words("--audio beat.wav")).is_err());
        assert!(parse_post_args(&words("hello --audio")).is_err());
    }
}
