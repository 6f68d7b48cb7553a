use anyhow::{bail, Context, Result};
use std::env;
use tracemoe::{
    AnilistRef, ApiErrorKind, Config, Error, QuotaStatus, SearchOptions, SearchResult, TraceMoe,
};

const USAGE: &str = "usage: tracemoe [--anilist-id ID] [--no-cut-borders] [--no-anilist-info] <image url | file>
       tracemoe --me";

fn print_quota(me: &QuotaStatus) {
    println!("ID: {}", me.id);
    println!("Priority: {}", me.priority);
    println!("Concurrency: {}", me.concurrency);
    println!("Quota: {} / {} used", me.quota_used, me.quota);
    print_limits(&me.limits);
}

fn print_limits(limits: &tracemoe::RateLimitInfo) {
    if limits.limit == 0 {
        return;
    }
    println!(
        "Rate limit: {} / {} left, resets in {}s",
        limits.remaining,
        limits.limit,
        limits.reset_timedelta().num_seconds().max(0)
    );
}

fn print_result(result: &SearchResult) {
    println!("Found {} results.", result.matches.len());

    let Some(best) = result.best_match() else {
        println!("No matches found.");
        return;
    };

    println!("\n--- Best Match ---");
    println!("Similarity: {}", best.short_similarity());
    match &best.anilist {
        AnilistRef::Info(info) => {
            println!("Title: {}", info.preferred_title().unwrap_or("Unknown Title"));
            if !info.synonyms.is_empty() {
                println!("Synonyms: {}", info.synonyms.join(", "));
            }
            println!("Is Adult: {}", if info.is_adult { "Yes" } else { "No" });
            if let Some(mal_url) = info.mal_url() {
                println!("MAL URL: {}", mal_url);
            }
        }
        AnilistRef::Id(id) => println!("AniList ID: {}", id),
    }
    if let Some(episode) = &best.episode {
        println!("Episode: {}", episode);
    }
    println!("Timestamp: {}", best.timestamp());
    println!("Video Preview: {}", best.video);
    print_limits(&result.limits);
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    let config = Config::from_env().context("invalid TRACEMOE_* environment")?;
    let api = TraceMoe::from_config(config)?;

    let mut options = SearchOptions::default();
    let mut image = None;
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--me" => {
                print_quota(&api.me().await?);
                return Ok(());
            }
            "--anilist-id" => {
                let id = args.next().context("--anilist-id needs a value")?;
                options.anilist_id = id.parse().context("--anilist-id must be a number")?;
            }
            "--no-cut-borders" => options.cut_borders = false,
            "--no-anilist-info" => options.anilist_info = false,
            "-h" | "--help" => {
                println!("{}", USAGE);
                return Ok(());
            }
            _ if image.is_none() => image = Some(arg),
            _ => bail!("unexpected argument {:?}\n{}", arg, USAGE),
        }
    }

    let Some(image) = image else {
        bail!("{}", USAGE);
    };
    options.is_url = image.starts_with("http://") || image.starts_with("https://");

    println!("Searching for image: {}", image);
    match api.search(image, &options).await {
        Ok(result) => print_result(&result),
        Err(e) => match e.api_kind() {
            Some(ApiErrorKind::SearchQueueFull) => {
                println!("Error: Search queue is full, please try again later.")
            }
            Some(ApiErrorKind::SearchQuotaDepleted) => {
                println!("Error: Monthly search limit reached.")
            }
            Some(_) => println!("API Error: {}", e),
            None if matches!(e, Error::Timeout(_)) => println!("Error: {}", e),
            None => return Err(e.into()),
        },
    }

    Ok(())
}
