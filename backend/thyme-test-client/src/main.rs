// src/main.rs

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::error::Error;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimeEntry {
    id: String,
    project_id: String,
    date: String,
    hours: f64,
    sync_status: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocalWeek {
    week_start: String,
    total_hours: f64,
    entries: Vec<TimeEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PricingView {
    price_sats: u64,
    quotes: Vec<serde_json::Value>,
    last_updated: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let base_url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "http://localhost:3000".to_string());
    let client = Client::new();

    // Test 1: Status page
    println!("\n🔍 Testing status page...");
    let status_response = client.get(format!("{}/status", base_url)).send().await?;
    println!("Status page: {}", status_response.status());

    // Test 2: Create an entry in the local cache
    println!("\n🔍 Creating a time entry...");
    let created = client
        .post(format!("{}/api/entries", base_url))
        .json(&json!({
            "projectId": "SMOKE-TEST",
            "date": "2024-01-02",
            "hours": 1.25,
            "notes": "smoke test"
        }))
        .send()
        .await?;
    if created.status() != StatusCode::CREATED {
        println!("Failed to create entry: {}", created.text().await?);
        return Ok(());
    }
    let entry = created.json::<TimeEntry>().await?;
    println!("Created entry: {:?}", entry);

    // Test 3: Read the week back
    println!("\n🔍 Listing the week of {}...", entry.date);
    let week = client
        .get(format!("{}/api/entries?date={}", base_url, entry.date))
        .send()
        .await?
        .json::<LocalWeek>()
        .await?;
    println!(
        "Week {}: {} entries, {} hours",
        week.week_start,
        week.entries.len(),
        week.total_hours
    );
    for e in &week.entries {
        println!("  {} {} {}h {}", e.id, e.project_id, e.hours, e.sync_status);
    }

    // Test 4: Invalid input is rejected
    println!("\n🔍 Posting an invalid entry...");
    let rejected = client
        .post(format!("{}/api/entries", base_url))
        .json(&json!({ "projectId": "SMOKE-TEST", "date": "2024-13-40", "hours": 1.0 }))
        .send()
        .await?;
    println!(
        "Invalid entry status: {} body: {}",
        rejected.status(),
        rejected.text().await?
    );

    // Test 5: Timer
    println!("\n🔍 Starting and stopping the timer...");
    let started = client
        .post(format!("{}/api/timer/start", base_url))
        .json(&json!({ "projectId": "SMOKE-TEST" }))
        .send()
        .await?;
    println!("Timer start: {}", started.status());
    let stopped = client
        .post(format!("{}/api/timer/stop", base_url))
        .send()
        .await?;
    println!("Timer stop: {} {}", stopped.status(), stopped.text().await?);

    // Test 6: Pricing
    println!("\n🔍 Fetching pricing...");
    let pricing = client
        .get(format!("{}/api/pricing", base_url))
        .send()
        .await?
        .json::<PricingView>()
        .await?;
    println!(
        "Price: {} sats, {} quotes, last updated {:?}",
        pricing.price_sats,
        pricing.quotes.len(),
        pricing.last_updated
    );

    // Clean up
    let deleted = client
        .delete(format!("{}/api/entries/{}", base_url, entry.id))
        .send()
        .await?;
    println!("\n🧹 Deleted smoke-test entry: {}", deleted.status());

    println!("\n✅ Testing complete!");
    Ok(())
}
