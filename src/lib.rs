/*!
# hackdesk

An internal admin dashboard for running a hackathon, built in Rust.

## Overview

Organisers sign in to a browser dashboard to track participant check-ins at
the college gate and the lab, hand out Wi-Fi credentials, send templated bulk
email, print ID-card badges and keep the sponsor list. The event's chat bot
talks to the same server: it reads its versioned configuration, posts
heartbeats and writes log entries. Every hour the participant list is backed
up as CSV and an HTML status report goes out by mail.

## Architecture

### Frontend Layer
- **Technologies**: HTML, CSS, vanilla JavaScript
- Static login and dashboard pages served by the server, talking to the JSON API

### Backend Layer
- **Technologies**: Rust, axum, tokio
- **Core Components**:
  - Document Store - JSON collections on disk with a single write lock
  - Check-in Tracker - Per-location check-in/check-out rules
  - Bot Integration - Versioned configuration with history, heartbeat, logs
  - Backup Job - CSV export, object upload, report email
  - Mailer - SMTP delivery and handlebars templates
  - Badge Generator - PDF badges with a QR code, zipped for batches

### Data Persistence Layer
- One JSON file per collection, replaced atomically on every commit
- CSV (optionally gzip-compressed) backups in a local directory or remote bucket

## Modules

- **store**: Document store (collections, unit-of-work transactions)
- **config**: Environment configuration
- **error**: Error type shared by every handler
- **participant**: Participants, check-in/check-out, Wi-Fi credentials, stats
- **sponsor**: Sponsor management
- **botconfig**: Bot configuration history and heartbeat status
- **activity**: Log entries written by the bot and by jobs
- **export**: CSV and XLSX export
- **storage**: Object storage for backups
- **mailer**: Mail transports and bulk sending
- **templates**: Handlebars templates
- **backup**: Scheduled backup pipeline
- **idcard**: Badge PDF generation
- **login**: Admin authentication and session middleware
- **app**: Routing and server lifecycle

## REST API Endpoints

- `/api/auth/...` - Login, logout, current admin, password change
- `/api/participants/...` - Participant CRUD, import, stats, check-in/out, Wi-Fi
- `/api/export/...` - CSV and XLSX downloads
- `/api/sponsors/...` - Sponsor CRUD
- `/api/bot/...` - Bot configuration, history, restore, status
- `/api/mail/...` - Bulk send and preview
- `/api/idcards/...` - Single badge PDF or zip batch
- `/api/cron/backup`, `/api/service/...` - Bearer-authenticated job and bot endpoints
*/

pub mod activity;
pub mod botconfig;
pub mod config;
pub mod error;
pub mod export;
pub mod participant;
pub mod sponsor;
pub mod store;

#[cfg(feature = "web")]
pub mod app;
#[cfg(feature = "web")]
pub mod backup;
#[cfg(feature = "web")]
pub mod idcard;
#[cfg(feature = "web")]
pub mod login;
#[cfg(feature = "web")]
pub mod mailer;
#[cfg(feature = "web")]
pub mod storage;
#[cfg(feature = "web")]
pub mod templates;

pub use config::Config;
pub use error::AppError;
pub use store::Store;
