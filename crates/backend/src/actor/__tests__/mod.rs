mod helpers;
mod registry;
mod watcher;
