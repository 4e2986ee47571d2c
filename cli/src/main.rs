#![warn(clippy::nursery, clippy::pedantic)]
#![deny(unsafe_code)]

// ephemeral-paste CLI Client
// Copyright (C) 2021  Edward Shen
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use atty::Stream;
use clap::Parser;
use ephemeral_paste_common::{
    CreatePasteRequest, CreatePasteResponse, ErrorResponse, PasteLocator, PasteView, Url,
    PASTES_ENDPOINT,
};
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;

#[derive(Parser)]
struct Opts {
    #[clap(subcommand)]
    action: Action,
}

#[derive(Parser)]
enum Action {
    Upload {
        /// The server to upload the paste to.
        url: Url,
        /// Seconds until the paste expires.
        #[clap(short, long)]
        ttl: Option<i64>,
        /// How many times the paste can be viewed before it is gone.
        #[clap(short, long)]
        max_views: Option<i64>,
        /// File to upload. Reads stdin when absent.
        path: Option<PathBuf>,
    },
    Download {
        /// The paste to download. Counts as a view.
        url: PasteLocator,
    },
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    match opts.action {
        Action::Upload {
            url,
            ttl,
            max_views,
            path,
        } => handle_upload(url, ttl, max_views, path),
        Action::Download { url } => handle_download(&url),
    }?;

    Ok(())
}

fn handle_upload(
    mut url: Url,
    ttl: Option<i64>,
    max_views: Option<i64>,
    path: Option<PathBuf>,
) -> Result<()> {
    let content = match path {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            if atty::is(Stream::Stdin) {
                bail!("Nothing to upload. Pass a file or pipe data in.");
            }
            let mut buffer = String::new();
            std::io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };

    url.set_fragment(None);
    url.path_segments_mut()
        .map_err(|_| anyhow!("Failed to get base URL"))?
        .pop_if_empty()
        .extend(PASTES_ENDPOINT.trim_start_matches('/').split('/'));

    let res = Client::new()
        .post(url)
        .json(&CreatePasteRequest {
            content,
            ttl_seconds: ttl,
            max_views,
        })
        .send()
        .context("Request to server failed")?;

    if res.status() != StatusCode::CREATED {
        bail!("Upload failed: {}", describe_failure(res));
    }

    let created: CreatePasteResponse = res.json().context("Server sent a malformed response")?;
    if created.url.is_empty() {
        println!("{}", created.id);
    } else {
        println!("{}", created.url);
    }

    Ok(())
}

fn handle_download(url: &PasteLocator) -> Result<()> {
    let api_url = url.api_url().map_err(|e| anyhow!("Bad paste url: {}", e))?;
    let res = Client::new()
        .get(api_url)
        .send()
        .context("Failed to get data")?;

    match res.status() {
        StatusCode::OK => (),
        StatusCode::NOT_FOUND => bail!("This paste does not exist or has expired."),
        _ => bail!("Got bad response from server: {}", describe_failure(res)),
    }

    let view: PasteView = res.json().context("Server sent a malformed response")?;

    std::io::stdout().write_all(view.content.as_bytes())?;
    if atty::is(Stream::Stdout) && !view.content.ends_with('\n') {
        println!();
    }

    match view.remaining_views {
        Some(0) => eprintln!("That was the last view. The paste is now gone."),
        Some(n) => eprintln!("{} view(s) left.", n),
        None => (),
    }
    match view.expires_at {
        Some(time) => eprintln!(
            "{}",
            time.format("This paste will expire on %A, %B %-d, %Y at %T %Z.")
        ),
        None => eprintln!("This paste will not expire."),
    }

    Ok(())
}

fn describe_failure(res: Response) -> String {
    let status = res.status();
    res.json::<ErrorResponse>()
        .map_or_else(|_| status.to_string(), |body| format!("{} ({})", body.error, status))
}
