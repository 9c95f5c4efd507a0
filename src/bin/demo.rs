use parking_lot::Mutex;
use quantcore::prelude::*;
use quantcore::runtime::hooks::ON_BAR;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Replays a fixed set of daily closes as BAR events.
struct BarFeed {
    symbol: String,
    closes: Vec<f64>,
}

#[async_trait]
impl Plugin for BarFeed {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new("bar_feed", "0.1.0").with_description("Replays historical bars")
    }

    async fn setup(&mut self, ctx: &Context) -> Result<()> {
        ctx.set("feed.symbol", self.symbol.clone());
        ctx.set("feed.closes", self.closes.clone());
        Ok(())
    }
}

/// Emits BUY/SELL signals when price crosses its moving average.
struct MovingAverage {
    window: usize,
    prices: Arc<Mutex<VecDeque<f64>>>,
}

#[async_trait]
impl Plugin for MovingAverage {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new("ma_strategy", "0.1.0")
            .with_description("Moving average crossover")
            .with_dependency("bar_feed")
    }

    async fn setup(&mut self, ctx: &Context) -> Result<()> {
        let window = self.window;
        let prices = Arc::clone(&self.prices);
        let engine = Arc::downgrade(ctx.engine());

        ctx.engine().on(EventType::Bar, "ma_strategy", move |bar: &Event| {
            let close = bar.payload()["close"]
                .as_f64()
                .ok_or_else(|| CoreError::EventError("bar without close".to_string()))?;

            let average = {
                let mut prices = prices.lock();
                prices.push_back(close);
                if prices.len() > window {
                    prices.pop_front();
                }
                if prices.len() < window {
                    return Ok(());
                }
                prices.iter().sum::<f64>() / window as f64
            };

            let side = if close > average { "BUY" } else { "SELL" };
            if let Some(engine) = engine.upgrade() {
                engine.emit(
                    Event::new(
                        EventType::Signal,
                        json!({ "symbol": bar.payload()["symbol"], "side": side, "average": average }),
                    )
                    .with_source("ma_strategy"),
                );
            }
            Ok(())
        });
        Ok(())
    }

    fn implements_hook(&self, hook: &str) -> bool {
        hook == ON_BAR
    }

    async fn call_hook(&mut self, _hook: &str, _args: &Value, _ctx: &Context) -> Result<Value> {
        Ok(json!({ "buffered": self.prices.lock().len() }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let app = QuantApp::build()
        .with_config(AppConfig::new("ma-demo").with_signal_handling(false))
        .add_plugin(MovingAverage {
            window: 3,
            prices: Arc::new(Mutex::new(VecDeque::new())),
        })
        .add_plugin(BarFeed {
            symbol: "110001".to_string(),
            closes: vec![101.2, 101.8, 102.5, 101.1, 100.4, 102.9],
        })
        .build()?;

    let engine = app.engine();
    engine.add_middleware(middleware("bar_logger", |event: Event, next: Next<'_>| {
        if event.event_type() == EventType::Bar {
            info!(symbol = %event.payload()["symbol"], close = %event.payload()["close"], "bar");
        }
        next.run(event);
        Ok(())
    }));
    engine.on(EventType::Signal, "signal_printer", |signal: &Event| {
        println!("signal {}", signal.payload());
        Ok(())
    });

    app.run().await?;

    let ctx = app.context();
    let symbol = ctx.get_or("feed.symbol", "");
    let closes: Vec<f64> = serde_json::from_value(ctx.get_or("feed.closes", json!([])))?;
    for close in closes {
        ctx.emit_async(Event::new(EventType::Bar, json!({ "symbol": symbol, "close": close })).with_source("bar_feed"))
            .await;
    }

    let answers = app
        .plugin_manager()
        .call_hook(ON_BAR, &json!({ "symbol": symbol }), ctx)
        .await?;
    info!(answers = ?answers.values(), "on_bar hook");

    app.shutdown().await?;
    println!("{}", serde_json::to_string_pretty(&app.engine().stats())?);
    Ok(())
}
