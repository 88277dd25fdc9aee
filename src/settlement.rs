// src/settlement.rs
//
// Buy, sell and deposit each run as one SQLite transaction. Prices are
// resolved before the transaction opens so no lock is held across network
// I/O. Dropping an uncommitted transaction rolls it back, so every early
// return leaves state untouched.
use crate::db::{self, DbPool};
use crate::error::AppError;
use crate::lookup::PriceLookup;
use crate::models::{usd, Balance, PortfolioLine, PortfolioView, Quote, TradeReceipt};
use crate::validate::Order;
use chrono::Utc;
use log::{info, warn};
use rust_decimal::Decimal;

fn too_large() -> AppError {
    AppError::validation("amount too large")
}

/// `price * shares`, refusing results outside the decimal range.
fn cost(price: Decimal, shares: i64) -> Result<Decimal, AppError> {
    price.checked_mul(Decimal::from(shares)).ok_or_else(too_large)
}

/// Resolves a symbol, treating provider failures like an unknown symbol.
pub async fn quote(lookup: &dyn PriceLookup, symbol: &str) -> Result<Quote, AppError> {
    match lookup.lookup(symbol).await {
        Ok(Some(quote)) => Ok(quote),
        Ok(None) => Err(AppError::NotFound("invalid symbol".to_string())),
        Err(e) => {
            warn!("Price lookup for {} failed: {}", symbol, e);
            Err(AppError::Lookup(e))
        }
    }
}

pub async fn buy(
    pool: &DbPool,
    lookup: &dyn PriceLookup,
    user_id: i64,
    order: &Order,
) -> Result<TradeReceipt, AppError> {
    let quote = quote(lookup, &order.symbol).await?;
    let total = cost(quote.price, order.shares)?;

    let mut tx = pool.begin().await?;
    if !db::lock_user(&mut tx, user_id).await? {
        return Err(AppError::auth("unknown user"));
    }

    let cash = db::user_cash(&mut tx, user_id).await?;
    if cash < total {
        return Err(AppError::InsufficientFunds {
            needed: total,
            available: cash,
        });
    }

    match db::find_holding(&mut tx, user_id, &order.symbol).await? {
        None => {
            db::insert_holding(
                &mut tx,
                user_id,
                &order.symbol,
                &quote.name,
                order.shares,
                quote.price,
                total,
            )
            .await?
        }
        Some(holding) => {
            // The position is re-marked at the latest purchase price.
            let shares = holding
                .shares
                .checked_add(order.shares)
                .ok_or_else(too_large)?;
            db::update_holding(
                &mut tx,
                holding.id,
                shares,
                quote.price,
                cost(quote.price, shares)?,
            )
            .await?
        }
    }

    let cash = cash - total;
    db::set_cash(&mut tx, user_id, cash).await?;
    db::append_history(
        &mut tx,
        user_id,
        &order.symbol,
        order.shares,
        quote.price,
        Utc::now(),
    )
    .await?;
    tx.commit().await?;

    info!(
        "User {} bought {} {} at {} for {}",
        user_id, order.shares, order.symbol, quote.price, total
    );
    Ok(TradeReceipt {
        symbol: order.symbol.clone(),
        name: quote.name,
        shares: order.shares,
        price: quote.price,
        total,
        cash,
    })
}

/// Sells part or all of a position. The remaining cost basis is the stored
/// purchase price times the shares still held; a fully sold position is
/// deleted.
pub async fn sell(
    pool: &DbPool,
    lookup: &dyn PriceLookup,
    user_id: i64,
    order: &Order,
) -> Result<TradeReceipt, AppError> {
    let quote = quote(lookup, &order.symbol).await?;
    let proceeds = cost(quote.price, order.shares)?;

    let mut tx = pool.begin().await?;
    if !db::lock_user(&mut tx, user_id).await? {
        return Err(AppError::auth("unknown user"));
    }

    let holding = db::find_holding(&mut tx, user_id, &order.symbol).await?;
    let held = holding.as_ref().map_or(0, |h| h.shares);
    let holding = match holding {
        Some(h) if h.shares >= order.shares => h,
        _ => {
            return Err(AppError::InsufficientShares {
                requested: order.shares,
                held,
            })
        }
    };

    let cash = db::user_cash(&mut tx, user_id)
        .await?
        .checked_add(proceeds)
        .ok_or_else(too_large)?;
    db::set_cash(&mut tx, user_id, cash).await?;

    let remaining = holding.shares - order.shares;
    if remaining == 0 {
        db::delete_holding(&mut tx, holding.id).await?;
    } else {
        db::update_holding(
            &mut tx,
            holding.id,
            remaining,
            holding.price,
            cost(holding.price, remaining)?,
        )
        .await?;
    }

    db::append_history(
        &mut tx,
        user_id,
        &order.symbol,
        -order.shares,
        quote.price,
        Utc::now(),
    )
    .await?;
    tx.commit().await?;

    info!(
        "User {} sold {} {} at {} for {}",
        user_id, order.shares, order.symbol, quote.price, proceeds
    );
    Ok(TradeReceipt {
        symbol: order.symbol.clone(),
        name: holding.name,
        shares: order.shares,
        price: quote.price,
        total: proceeds,
        cash,
    })
}

pub async fn deposit(pool: &DbPool, user_id: i64, amount: Decimal) -> Result<Balance, AppError> {
    if amount <= Decimal::ZERO {
        return Err(AppError::validation("must enter a value greater than 0"));
    }

    let mut tx = pool.begin().await?;
    if !db::lock_user(&mut tx, user_id).await? {
        return Err(AppError::auth("unknown user"));
    }
    let cash = db::user_cash(&mut tx, user_id)
        .await?
        .checked_add(amount)
        .ok_or_else(too_large)?;
    db::set_cash(&mut tx, user_id, cash).await?;
    tx.commit().await?;

    info!("User {} deposited {}", user_id, amount);
    Ok(Balance {
        cash,
        cash_usd: usd(cash),
    })
}

/// Values every holding at its live price. A holding whose price cannot be
/// fetched is valued at its stored purchase price and flagged stale.
pub async fn portfolio(
    pool: &DbPool,
    lookup: &dyn PriceLookup,
    user_id: i64,
) -> Result<PortfolioView, AppError> {
    let user = db::find_user(pool, user_id)
        .await?
        .ok_or_else(|| AppError::auth("unknown user"))?;
    let holdings = db::holdings(pool, user_id).await?;

    let mut total = user.cash;
    let mut lines = Vec::with_capacity(holdings.len());
    for holding in holdings {
        let (price, stale) = match lookup.lookup(&holding.symbol).await {
            Ok(Some(quote)) => (quote.price, false),
            Ok(None) => {
                warn!("No live price for {}, using stored price", holding.symbol);
                (holding.price, true)
            }
            Err(e) => {
                warn!(
                    "Price lookup for {} failed, using stored price: {}",
                    holding.symbol, e
                );
                (holding.price, true)
            }
        };
        let value = cost(price, holding.shares)?;
        total = total.checked_add(value).ok_or_else(too_large)?;
        lines.push(PortfolioLine {
            symbol: holding.symbol,
            name: holding.name,
            shares: holding.shares,
            price,
            price_usd: usd(price),
            value,
            value_usd: usd(value),
            stale,
        });
    }

    Ok(PortfolioView {
        cash: user.cash,
        cash_usd: usd(user.cash),
        holdings: lines,
        total,
        total_usd: usd(total),
    })
}
